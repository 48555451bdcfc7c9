//! Typed interpretation of repaired model replies.

use std::sync::LazyLock;

use jsonschema::Validator;
use serde::Deserialize;
use serde_json::Value;

use crate::core::repair::{Expect, ParseError, extract_json};
use crate::core::types::CombinedPrompt;

const COMBINED_PROMPT_SCHEMA: &str = include_str!("../../schemas/combined_prompt.schema.json");

static COMBINED_PROMPT_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(COMBINED_PROMPT_SCHEMA).expect("embedded schema should be JSON");
    jsonschema::options()
        .with_draft(jsonschema::Draft::Draft202012)
        .build(&schema)
        .expect("embedded schema should compile")
});

/// Outcome of interpreting a command-generation reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelReply {
    Parsed(CombinedPrompt),
    Malformed { raw: String, reason: String },
}

impl ModelReply {
    pub fn into_result(self) -> Result<CombinedPrompt, ParseError> {
        match self {
            ModelReply::Parsed(prompt) => Ok(prompt),
            ModelReply::Malformed { raw, reason } => Err(ParseError { raw, reason }),
        }
    }
}

#[derive(Deserialize)]
struct WireReply {
    #[serde(rename = "nlResponse", default)]
    nl_response: Option<String>,
    commands: Vec<String>,
    #[serde(rename = "visionNeeded", default)]
    vision_needed: Option<VisionFlag>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VisionFlag {
    Bool(bool),
    Text(String),
}

impl VisionFlag {
    fn is_set(&self) -> bool {
        match self {
            VisionFlag::Bool(flag) => *flag,
            VisionFlag::Text(text) => text.trim().eq_ignore_ascii_case("true"),
        }
    }
}

/// Interpret a raw reply to the command-generation prompt.
///
/// `commands` must be an array of strings. `nlResponse` defaults to empty and
/// `visionNeeded` to false.
pub fn parse_combined_prompt(raw: &str) -> ModelReply {
    let malformed = |reason: String| ModelReply::Malformed {
        raw: raw.to_string(),
        reason,
    };

    let json = match extract_json(raw, Expect::Object) {
        Ok(json) => json,
        Err(err) => return malformed(err.reason),
    };
    let value: Value = match serde_json::from_str(&json) {
        Ok(value) => value,
        Err(err) => return malformed(format!("invalid JSON: {err}")),
    };

    let violations: Vec<String> = COMBINED_PROMPT_VALIDATOR
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !violations.is_empty() {
        return malformed(format!(
            "reply does not match the command schema: {}",
            violations.join("; ")
        ));
    }

    match serde_json::from_value::<WireReply>(value) {
        Ok(wire) => ModelReply::Parsed(CombinedPrompt {
            nl_response: wire.nl_response.unwrap_or_default(),
            commands: wire.commands,
            vision_needed: wire.vision_needed.is_some_and(|flag| flag.is_set()),
        }),
        Err(err) => malformed(format!("unexpected reply shape: {err}")),
    }
}

/// One entry of a decomposed goal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub description: String,
    pub dependencies: Vec<usize>,
}

/// Interpret a raw reply to the task-decomposition prompt.
///
/// Accepts `[{"description": ..}]`, `{"tasks": [..]}` and arrays of plain
/// strings. Entries with an empty description are dropped.
pub fn parse_task_list(raw: &str) -> Result<Vec<TaskSpec>, ParseError> {
    let json = extract_json(raw, Expect::Array)?;
    let value: Value = serde_json::from_str(&json)
        .map_err(|err| ParseError::new(raw, format!("invalid JSON: {err}")))?;

    let mut specs = Vec::new();
    collect_tasks(&value, &mut specs);
    Ok(specs)
}

fn collect_tasks(value: &Value, specs: &mut Vec<TaskSpec>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_tasks(item, specs);
            }
        }
        Value::String(text) => push_spec(specs, text, Vec::new()),
        Value::Object(map) => {
            if let Some(Value::String(description)) = map.get("description") {
                let dependencies = map
                    .get("dependencies")
                    .or_else(|| map.get("dependsOn"))
                    .and_then(Value::as_array)
                    .map(|indices| {
                        indices
                            .iter()
                            .filter_map(Value::as_u64)
                            .filter_map(|index| usize::try_from(index).ok())
                            .collect()
                    })
                    .unwrap_or_default();
                push_spec(specs, description, dependencies);
            } else if let Some(tasks) = map.get("tasks") {
                collect_tasks(tasks, specs);
            }
        }
        _ => {}
    }
}

fn push_spec(specs: &mut Vec<TaskSpec>, description: &str, dependencies: Vec<usize>) {
    let description = description.trim();
    if !description.is_empty() {
        specs.push(TaskSpec {
            description: description.to_string(),
            dependencies,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(raw: &str) -> CombinedPrompt {
        match parse_combined_prompt(raw) {
            ModelReply::Parsed(prompt) => prompt,
            ModelReply::Malformed { reason, .. } => panic!("unexpected malformed reply: {reason}"),
        }
    }

    fn malformed_reason(raw: &str) -> String {
        match parse_combined_prompt(raw) {
            ModelReply::Parsed(prompt) => panic!("unexpected parse: {prompt:?}"),
            ModelReply::Malformed { raw: kept, reason } => {
                assert_eq!(kept, raw);
                reason
            }
        }
    }

    #[test]
    fn full_reply_is_parsed() {
        let prompt = parsed(
            "```json\n{\"nlResponse\": \"Opening Spotify\", \"commands\": [\"open -a Spotify\"], \"visionNeeded\": false}\n```",
        );
        assert_eq!(prompt.nl_response, "Opening Spotify");
        assert_eq!(prompt.commands, vec!["open -a Spotify"]);
        assert!(!prompt.vision_needed);
    }

    #[test]
    fn optional_fields_default() {
        let prompt = parsed(r#"{"commands": ["ls"]}"#);
        assert_eq!(prompt.nl_response, "");
        assert!(!prompt.vision_needed);

        let prompt = parsed(r#"{"nlResponse": null, "commands": [], "visionNeeded": null}"#);
        assert!(prompt.commands.is_empty());
    }

    #[test]
    fn vision_flag_accepts_strings() {
        assert!(parsed(r#"{"commands": [], "visionNeeded": "true"}"#).vision_needed);
        assert!(!parsed(r#"{"commands": [], "visionNeeded": "False"}"#).vision_needed);
    }

    #[test]
    fn wrong_shapes_are_malformed() {
        assert!(malformed_reason(r#"{"nlResponse": "hi"}"#).contains("schema"));
        assert!(malformed_reason(r#"{"commands": "ls"}"#).contains("schema"));
        assert!(malformed_reason(r#"{"commands": [1, 2]}"#).contains("schema"));
        assert!(malformed_reason(r#"{"commands": [], "visionNeeded": "maybe"}"#).contains("schema"));
        assert!(malformed_reason("no json here").contains("no balanced"));
    }

    #[test]
    fn malformed_converts_to_parse_error() {
        let err = parse_combined_prompt("nothing")
            .into_result()
            .expect_err("malformed");
        assert_eq!(err.raw, "nothing");
    }

    #[test]
    fn task_list_accepts_objects_strings_and_wrappers() {
        let specs = parse_task_list(
            r#"Here is the plan: [{"description": "Open Spotify"}, "Play music", {"description": "  "}]"#,
        )
        .expect("parse");
        let descriptions: Vec<_> = specs.iter().map(|spec| spec.description.as_str()).collect();
        assert_eq!(descriptions, vec!["Open Spotify", "Play music"]);

        let specs = parse_task_list(
            r#"{"tasks": [{"description": "a"}, {"description": "b", "dependencies": [0]}]}"#,
        )
        .expect("parse");
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].dependencies, vec![0]);
    }

    #[test]
    fn task_list_without_json_is_a_parse_error() {
        let err = parse_task_list("I think you should open Spotify.").expect_err("no json");
        assert_eq!(err.raw, "I think you should open Spotify.");
    }
}

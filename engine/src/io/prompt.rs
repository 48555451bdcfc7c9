//! System prompt builder for the task and command generators.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::io::config::Platform;

const TASK_GENERATOR_TEMPLATE: &str = include_str!("prompts/task_generator.md");
const COMMAND_GENERATOR_TEMPLATE: &str = include_str!("prompts/command_generator.md");

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker pattern should compile")
});

/// Drop order when a rendered prompt exceeds its budget.
const DROP_ORDER: [&str; 3] = ["context", "installation", "feedback"];

/// Inputs for one command-generation prompt.
#[derive(Debug, Clone, Default)]
pub struct CommandPromptInputs<'a> {
    /// Summary of the host from the system-info collaborator. May be empty.
    pub system_context: &'a str,
    /// Sanitized failure text from the previous attempt. Empty on the first.
    pub feedback: &'a str,
    pub installation: bool,
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Renders system prompts within a byte budget, dropping less critical
/// sections first.
#[derive(Debug)]
pub struct PromptBuilder {
    env: Environment<'static>,
    platform: Platform,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(platform: Platform, budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("task_generator", TASK_GENERATOR_TEMPLATE)
            .context("load task generator template")?;
        env.add_template("command_generator", COMMAND_GENERATOR_TEMPLATE)
            .context("load command generator template")?;
        Ok(Self {
            env,
            platform,
            budget_bytes,
        })
    }

    pub fn build_task_generator(&self) -> Result<String> {
        let rendered = self
            .env
            .get_template("task_generator")?
            .render(context! {
                platform => self.platform.as_str(),
                platform_name => self.platform.display_name(),
            })
            .context("render task generator prompt")?;
        Ok(self.fit(&rendered))
    }

    pub fn build_command_generator(&self, input: &CommandPromptInputs<'_>) -> Result<String> {
        let rendered = self
            .env
            .get_template("command_generator")?
            .render(context! {
                platform => self.platform.as_str(),
                platform_name => self.platform.display_name(),
                shell => shell_name(self.platform),
                system_context => non_empty(input.system_context),
                feedback => non_empty(input.feedback),
                installation => input.installation,
            })
            .context("render command generator prompt")?;
        Ok(self.fit(&rendered))
    }

    fn fit(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        render_sections(&sections)
    }
}

fn shell_name(platform: Platform) -> &'static str {
    match platform {
        Platform::Windows => "cmd /C",
        Platform::Macos | Platform::Linux => "/bin/sh -c",
    }
}

fn non_empty(text: &str) -> Option<&str> {
    Some(text.trim()).filter(|trimmed| !trimmed.is_empty())
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());
        let required = kind.as_str() == "required";
        let content = rendered[whole.end()..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let other_len: usize = sections
        .iter()
        .take(sections.len().saturating_sub(1))
        .map(|s| s.content.len())
        .sum();
    let allowed = budget.saturating_sub(other_len);
    if let Some(last) = sections.last_mut()
        && last.content.len() > allowed
    {
        let before_len = last.content.len();
        truncate_at_boundary(&mut last.content, allowed.saturating_sub(12));
        last.content.push_str("\n[truncated]");
        debug!(
            section = last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

fn truncate_at_boundary(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .filter(|content| !content.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(platform: Platform) -> PromptBuilder {
        PromptBuilder::new(platform, 10_000).expect("builder")
    }

    /// Verifies command prompt sections appear in a stable order.
    #[test]
    fn command_prompt_ordering_is_stable() {
        let prompt = builder(Platform::Macos)
            .build_command_generator(&CommandPromptInputs {
                system_context: "Home: ~",
                feedback: "exit status 1",
                installation: true,
            })
            .expect("render");

        let positions: Vec<usize> = [
            "### Command Generator Contract",
            "### Platform Notes",
            "### System Context",
            "### Installation",
            "### Previous Attempt Failed",
            "### Output Format",
        ]
        .iter()
        .map(|header| prompt.find(header).unwrap_or_else(|| panic!("missing {header}")))
        .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(!prompt.contains("<!--"));
    }

    /// Verifies optional sections vanish when their inputs are empty.
    #[test]
    fn empty_inputs_omit_optional_sections() {
        let prompt = builder(Platform::Linux)
            .build_command_generator(&CommandPromptInputs::default())
            .expect("render");
        assert!(!prompt.contains("### System Context"));
        assert!(!prompt.contains("### Installation"));
        assert!(!prompt.contains("### Previous Attempt Failed"));
        assert!(prompt.contains("xdg-open"));
        assert!(prompt.contains("/bin/sh -c"));
    }

    #[test]
    fn platform_notes_follow_the_target() {
        let mac = builder(Platform::Macos)
            .build_command_generator(&CommandPromptInputs::default())
            .expect("render");
        assert!(mac.contains("open -a \"Name\""));
        assert!(mac.contains("macOS"));

        let windows = builder(Platform::Windows)
            .build_command_generator(&CommandPromptInputs::default())
            .expect("render");
        assert!(windows.contains("cmd /C"));
        assert!(windows.contains("winget"));
    }

    /// Verifies the system context is dropped before feedback under a tight budget.
    #[test]
    fn budget_drops_context_before_feedback() {
        let context = "x".repeat(4_000);
        let prompt = PromptBuilder::new(Platform::Macos, 1_800)
            .expect("builder")
            .build_command_generator(&CommandPromptInputs {
                system_context: &context,
                feedback: "Command `ls` failed",
                installation: false,
            })
            .expect("render");
        assert!(!prompt.contains("### System Context"));
        assert!(prompt.contains("### Previous Attempt Failed"));
        assert!(prompt.contains("### Output Format"));
    }

    #[test]
    fn task_prompt_requests_json_array() {
        let prompt = builder(Platform::Macos)
            .build_task_generator()
            .expect("render");
        assert!(prompt.contains("### Task Planner Contract"));
        assert!(prompt.contains(r#"[{"description": "first task"}"#));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut text = "héllo".to_string();
        truncate_at_boundary(&mut text, 2);
        assert_eq!(text, "h");
    }
}

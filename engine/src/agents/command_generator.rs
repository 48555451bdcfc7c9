//! Per-task command generation.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::agents::{GenerateError, GeneratorConfig, prompt_error};
use crate::core::history::{ChatHistory, ChatMessage};
use crate::core::normalizer::normalize;
use crate::core::reply::{ModelReply, parse_combined_prompt};
use crate::core::types::CombinedPrompt;
use crate::core::validator::check_command;
use crate::io::model::{ChatRequest, ModelClient};
use crate::io::prompt::{CommandPromptInputs, PromptBuilder};

const INSTALL_KEYWORDS: &[&str] = &["install", "setup", "set up", "download", "configure", "deploy"];

/// Feedback longer than this is cut before it reaches the prompt.
const MAX_FEEDBACK_CHARS: usize = 2_000;

static SECRET_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b([A-Z0-9_]*(?:KEY|TOKEN|SECRET|PASSWORD|PASSWD)[A-Z0-9_]*)=("[^"]*"|'[^']*'|\S+)"#,
    )
    .expect("secret pattern should compile")
});

/// One command-generation request.
#[derive(Debug, Clone, Copy)]
pub struct CommandRequest<'a> {
    /// The original task description. Never rewritten between retries.
    pub task: &'a str,
    /// Failure text from the previous attempt, empty on the first.
    pub feedback: &'a str,
    pub installation: bool,
}

/// Asks the model for the commands that carry out one task.
#[derive(Debug)]
pub struct CommandGenerator {
    config: GeneratorConfig,
    prompts: PromptBuilder,
    system_context: String,
    home_dir: Option<String>,
}

impl CommandGenerator {
    pub fn new(config: GeneratorConfig, system_context: String) -> anyhow::Result<Self> {
        let prompts = PromptBuilder::new(config.platform, config.prompt_budget_bytes)?;
        Ok(Self {
            config,
            prompts,
            system_context,
            home_dir: dirs::home_dir().map(|home| home.to_string_lossy().into_owned()),
        })
    }

    /// Override the home directory hidden from feedback.
    pub fn with_home_dir(mut self, home_dir: Option<String>) -> Self {
        self.home_dir = home_dir;
        self
    }

    /// Generate, normalize and safety-check the commands for one task.
    #[instrument(skip_all, fields(model = %self.config.model, installation = request.installation))]
    pub fn run<M: ModelClient + ?Sized>(
        &self,
        model: &M,
        request: &CommandRequest<'_>,
        history: &mut ChatHistory,
    ) -> Result<CombinedPrompt, GenerateError> {
        let feedback = sanitize_feedback(request.feedback, self.home_dir.as_deref());
        let system = self
            .prompts
            .build_command_generator(&CommandPromptInputs {
                system_context: &self.system_context,
                feedback: &feedback,
                installation: request.installation,
            })
            .map_err(|err| prompt_error(&err))?;
        let user = format!("Task: {}", request.task.trim());

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(system));
        messages.extend(history.messages().iter().cloned());
        messages.push(ChatMessage::user(user.as_str()));

        let raw = model.chat(&ChatRequest::new(&self.config.model, &messages).json())?;
        debug!(bytes = raw.len(), "command reply received");
        history.push_user(user);
        history.push_assistant(raw.trim());

        let mut prompt = match parse_combined_prompt(&raw) {
            ModelReply::Parsed(prompt) => prompt,
            ModelReply::Malformed { raw, reason } => {
                warn!(reason = %reason, "malformed command reply");
                return Err(GenerateError::Malformed { raw, reason });
            }
        };

        prompt.commands = prompt
            .commands
            .iter()
            .map(|command| normalize(command))
            .filter(|command| !command.is_empty())
            .collect();
        if prompt.commands.is_empty() && !prompt.vision_needed {
            return Err(GenerateError::Empty("commands"));
        }
        for command in &prompt.commands {
            check_command(command)?;
        }

        debug!(commands = ?prompt.commands, vision = prompt.vision_needed, "commands generated");
        Ok(prompt)
    }
}

/// True when a task description reads like a software installation.
pub fn looks_like_installation(task: &str) -> bool {
    let lowered = task.to_lowercase();
    INSTALL_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

/// Prepare failure text for the prompt: trimmed, home directory shown as
/// `~`, secret-looking assignments redacted, long text cut.
pub fn sanitize_feedback(feedback: &str, home_dir: Option<&str>) -> String {
    let mut text = feedback.trim().to_string();
    if let Some(home) = home_dir.map(|home| home.trim_end_matches('/'))
        && home.len() > 1
    {
        text = text.replace(home, "~");
    }
    let mut text = SECRET_ASSIGNMENT
        .replace_all(&text, "${1}=[redacted]")
        .into_owned();
    if text.chars().count() > MAX_FEEDBACK_CHARS {
        text = text.chars().take(MAX_FEEDBACK_CHARS).collect();
        text.push_str("\n[feedback truncated]");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::validator::RejectReason;
    use crate::io::config::Platform;
    use crate::test_support::ScriptedModel;

    fn generator() -> CommandGenerator {
        CommandGenerator::new(
            GeneratorConfig {
                model: "llama3.2".to_string(),
                platform: Platform::Macos,
                prompt_budget_bytes: 16_000,
            },
            "Home directory: /Users/ana".to_string(),
        )
        .expect("generator")
        .with_home_dir(Some("/Users/ana".to_string()))
    }

    fn request<'a>(task: &'a str, feedback: &'a str) -> CommandRequest<'a> {
        CommandRequest {
            task,
            feedback,
            installation: looks_like_installation(task),
        }
    }

    #[test]
    fn commands_are_normalized() {
        let model = ScriptedModel::new([Ok(
            r#"{"nlResponse": "Opening Spotify", "commands": ["open -a Spotify.app"], "visionNeeded": false}"#
                .to_string(),
        )]);
        let prompt = generator()
            .run(&model, &request("Open Spotify", ""), &mut ChatHistory::new(8))
            .expect("prompt");
        assert_eq!(prompt.commands, vec![r#"open -a "Spotify""#]);
        assert_eq!(prompt.nl_response, "Opening Spotify");
        assert_eq!(model.formats(), vec![Some("json".to_string())]);
    }

    #[test]
    fn feedback_reaches_the_system_prompt() {
        let model = ScriptedModel::new([Ok(r#"{"commands": ["ls"]}"#.to_string())]);
        generator()
            .run(
                &model,
                &request("List files", "Command `ls /Users/ana/x` failed: API_KEY=abc123"),
                &mut ChatHistory::new(8),
            )
            .expect("prompt");

        let sent = model.requests().pop().expect("request");
        let system = &sent[0].content;
        assert!(system.contains("### Previous Attempt Failed"));
        assert!(system.contains("ls ~/x"));
        assert!(system.contains("API_KEY=[redacted]"));
        assert!(!system.contains("abc123"));
        assert_eq!(sent.last().map(|m| m.content.as_str()), Some("Task: List files"));
    }

    #[test]
    fn dangerous_output_is_rejected() {
        let model = ScriptedModel::new([Ok(r#"{"commands": ["sudo rm -rf /"]}"#.to_string())]);
        let err = generator()
            .run(&model, &request("Clean disk", ""), &mut ChatHistory::new(8))
            .expect_err("rejected");
        match err {
            GenerateError::Rejected(rejection) => {
                assert_eq!(rejection.reason, RejectReason::DenyListed("rm -rf"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn empty_and_malformed_replies_are_errors() {
        let model = ScriptedModel::new([
            Ok(r#"{"commands": ["  "]}"#.to_string()),
            Ok(r#"{"nlResponse": "no commands field"}"#.to_string()),
        ]);
        let generator = generator();
        let mut history = ChatHistory::new(8);
        assert_eq!(
            generator
                .run(&model, &request("x", ""), &mut history)
                .expect_err("empty"),
            GenerateError::Empty("commands")
        );
        assert!(matches!(
            generator.run(&model, &request("x", ""), &mut history),
            Err(GenerateError::Malformed { .. })
        ));
    }

    #[test]
    fn vision_only_reply_may_have_no_commands() {
        let model = ScriptedModel::new([Ok(
            r#"{"nlResponse": "Looking", "commands": [], "visionNeeded": "true"}"#.to_string(),
        )]);
        let prompt = generator()
            .run(&model, &request("Describe the screen", ""), &mut ChatHistory::new(8))
            .expect("prompt");
        assert!(prompt.vision_needed);
        assert!(prompt.commands.is_empty());
    }

    #[test]
    fn installation_keywords_are_detected() {
        assert!(looks_like_installation("Install wget with Homebrew"));
        assert!(looks_like_installation("Download the latest release"));
        assert!(!looks_like_installation("Open Spotify"));
    }

    #[test]
    fn long_feedback_is_truncated() {
        let long = "x".repeat(MAX_FEEDBACK_CHARS + 50);
        let sanitized = sanitize_feedback(&long, None);
        assert!(sanitized.ends_with("[feedback truncated]"));
        assert!(sanitized.len() < long.len());
    }
}

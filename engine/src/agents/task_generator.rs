//! Goal decomposition into an ordered task list.

use tracing::{debug, info, instrument};

use crate::agents::{GenerateError, GeneratorConfig, prompt_error};
use crate::core::history::{ChatHistory, ChatMessage};
use crate::core::reply::parse_task_list;
use crate::core::types::Task;
use crate::io::model::{ChatRequest, ModelClient};
use crate::io::prompt::PromptBuilder;

/// Turns a goal into `Pending` tasks with one model request.
#[derive(Debug)]
pub struct TaskGenerator {
    config: GeneratorConfig,
    prompts: PromptBuilder,
    max_retries: u32,
}

impl TaskGenerator {
    pub fn new(config: GeneratorConfig, max_retries: u32) -> anyhow::Result<Self> {
        let prompts = PromptBuilder::new(config.platform, config.prompt_budget_bytes)?;
        Ok(Self {
            config,
            prompts,
            max_retries,
        })
    }

    /// Decompose `goal`. The request and reply are appended to `history`.
    #[instrument(skip_all, fields(model = %self.config.model))]
    pub fn run<M: ModelClient + ?Sized>(
        &self,
        model: &M,
        goal: &str,
        history: &mut ChatHistory,
    ) -> Result<Vec<Task>, GenerateError> {
        let system = self
            .prompts
            .build_task_generator()
            .map_err(|err| prompt_error(&err))?;
        let user = format!("Goal: {}", goal.trim());

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(system));
        messages.extend(history.messages().iter().cloned());
        messages.push(ChatMessage::user(user.as_str()));

        let raw = model.chat(&ChatRequest::new(&self.config.model, &messages).json())?;
        debug!(bytes = raw.len(), "task list reply received");
        history.push_user(user);
        history.push_assistant(raw.trim());

        let specs = parse_task_list(&raw)?;
        if specs.is_empty() {
            return Err(GenerateError::Empty("tasks"));
        }

        let tasks: Vec<Task> = specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| {
                let mut task = Task::new(spec.description, self.max_retries);
                task.dependencies = spec
                    .dependencies
                    .into_iter()
                    .filter(|dep| *dep < index)
                    .collect();
                task
            })
            .collect();
        info!(count = tasks.len(), "goal decomposed into tasks");
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::history::Role;
    use crate::core::types::TaskStatus;
    use crate::io::config::Platform;
    use crate::io::model::ModelError;
    use crate::test_support::ScriptedModel;

    fn generator() -> TaskGenerator {
        TaskGenerator::new(
            GeneratorConfig {
                model: "llama3.2".to_string(),
                platform: Platform::Macos,
                prompt_budget_bytes: 16_000,
            },
            3,
        )
        .expect("generator")
    }

    #[test]
    fn reply_becomes_pending_tasks() {
        let model = ScriptedModel::new([Ok(
            r#"```json
[{"description": "Open Spotify"}, {"description": "Play the Discover playlist", "dependencies": [0, 5]}]
```"#
                .to_string(),
        )]);
        let mut history = ChatHistory::new(8);

        let tasks = generator()
            .run(&model, "  play some music ", &mut history)
            .expect("tasks");

        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|task| task.status == TaskStatus::Pending));
        assert!(tasks.iter().all(|task| task.attempt == 0 && task.max_retries == 3));
        assert_eq!(tasks[1].dependencies, vec![0]);

        let request = model.requests().pop().expect("request");
        assert_eq!(request[0].role, Role::System);
        assert_eq!(request.last().map(|m| m.content.as_str()), Some("Goal: play some music"));
        assert_eq!(model.formats(), vec![Some("json".to_string())]);

        let roles: Vec<Role> = history.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }

    #[test]
    fn unparseable_reply_keeps_the_raw_text() {
        let model = ScriptedModel::new([Ok("Sure, I can help with that!".to_string())]);
        let err = generator()
            .run(&model, "open Spotify", &mut ChatHistory::new(8))
            .expect_err("parse");
        assert_eq!(err.raw_reply(), Some("Sure, I can help with that!"));
    }

    #[test]
    fn empty_list_is_an_error() {
        let model = ScriptedModel::new([Ok("[]".to_string())]);
        let err = generator()
            .run(&model, "nothing", &mut ChatHistory::new(8))
            .expect_err("empty");
        assert_eq!(err, GenerateError::Empty("tasks"));
    }

    #[test]
    fn backend_failure_is_reported() {
        let model = ScriptedModel::new([Err(ModelError::Unavailable("connection refused".into()))]);
        let err = generator()
            .run(&model, "open Spotify", &mut ChatHistory::new(8))
            .expect_err("backend");
        assert!(matches!(err, GenerateError::Backend(_)));
    }
}

//! Task executor: the generate, validate, execute, retry loop for one task.

use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::agents::GenerateError;
use crate::agents::command_generator::{CommandGenerator, CommandRequest, looks_like_installation};
use crate::core::history::ChatHistory;
use crate::core::types::{Goal, TaskStatus};
use crate::core::validator::{Rejection, check_command};
use crate::io::audit::{AttemptRecord, ExecutionLog};
use crate::io::config::Dispatch;
use crate::io::model::{ModelClient, ModelError};
use crate::io::shell::{Shell, ShellOutcome};
use crate::io::vision::VisionClient;

/// Characters of command output kept in feedback and the goal log.
const OUTPUT_EXCERPT_CHARS: usize = 1_000;

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub shell_timeout: Duration,
    pub dispatch: Dispatch,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell_timeout: Duration::from_secs(20),
            dispatch: Dispatch::Sequential,
        }
    }
}

/// Why one attempt failed. The Display text becomes the next attempt's feedback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptFailure {
    #[error("Command generation failed: {0}")]
    Generation(#[from] GenerateError),

    #[error("Vision model required but not enabled.")]
    VisionDisabled,

    #[error("Vision model required but unavailable: {0}")]
    VisionUnavailable(String),

    #[error("Vision analysis failed: {0}")]
    Vision(ModelError),

    #[error(transparent)]
    Rejected(Rejection),

    #[error("Command `{command}` failed ({}): {output}", exit_label(.code))]
    Command {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("Command `{command}` timed out after {secs}s: {output}")]
    Timeout {
        command: String,
        secs: u64,
        output: String,
    },

    #[error("Command `{command}` could not be started: {error}")]
    Spawn { command: String, error: String },
}

fn exit_label(code: &Option<i32>) -> String {
    match *code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Drives single tasks of a goal to a terminal status.
pub struct TaskExecutor<'a, M: ModelClient + ?Sized, S: Shell + ?Sized> {
    model: &'a M,
    shell: &'a S,
    vision: Option<&'a dyn VisionClient>,
    generator: &'a CommandGenerator,
    log: &'a ExecutionLog,
    config: ExecutorConfig,
}

impl<'a, M: ModelClient + ?Sized, S: Shell + ?Sized> TaskExecutor<'a, M, S> {
    pub fn new(
        model: &'a M,
        shell: &'a S,
        generator: &'a CommandGenerator,
        log: &'a ExecutionLog,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            model,
            shell,
            vision: None,
            generator,
            log,
            config,
        }
    }

    pub fn with_vision(mut self, vision: Option<&'a dyn VisionClient>) -> Self {
        self.vision = vision;
        self
    }

    /// Run task `index` of `goal` until it completes or its attempts run out.
    ///
    /// Returns `None` when `index` is out of range. A task that is already
    /// terminal is returned unchanged.
    #[instrument(skip_all, fields(task = index))]
    pub fn run_task(
        &self,
        goal: &mut Goal,
        index: usize,
        history: &mut ChatHistory,
    ) -> Option<TaskStatus> {
        let task = goal.tasks.get(index)?;
        if task.status.is_terminal() {
            return Some(task.status);
        }
        let description = task.description.clone();
        let budget = task.max_retries.max(1);
        let installation = looks_like_installation(&description);

        while goal.tasks[index].attempt < budget {
            let attempt = {
                let task = &mut goal.tasks[index];
                task.attempt += 1;
                task.status = TaskStatus::InProgress;
                task.attempt
            };
            info!(attempt, budget, "starting attempt");
            goal.log.push(format!(
                "Task {}: attempt {attempt}/{budget}: {description}",
                index + 1
            ));

            let feedback = goal.tasks[index].feedback.clone();
            let request = CommandRequest {
                task: &description,
                feedback: &feedback,
                installation,
            };
            let result = self.attempt(goal, index, &request, history);

            let status = match &result {
                Ok(()) => TaskStatus::Completed,
                Err(_) if attempt >= budget => TaskStatus::Failed,
                Err(_) => TaskStatus::InProgress,
            };
            let task = &mut goal.tasks[index];
            task.status = status;
            match result {
                Ok(()) => {
                    task.feedback.clear();
                    info!(attempt, "task completed");
                    goal.log
                        .push(format!("Task {}: completed", index + 1));
                }
                Err(failure) => {
                    task.feedback = failure.to_string();
                    warn!(attempt, failure = %task.feedback, "attempt failed");
                    goal.log
                        .push(format!("Task {}: attempt {attempt} failed: {failure}", index + 1));
                    if status == TaskStatus::Failed {
                        goal.log.push(format!(
                            "Task {}: failed after {attempt} attempt(s)",
                            index + 1
                        ));
                    }
                }
            }
            self.record(goal, index);
            if status.is_terminal() {
                return Some(status);
            }
        }

        // Entered with the budget already spent.
        let task = &mut goal.tasks[index];
        task.status = TaskStatus::Failed;
        Some(task.status)
    }

    fn attempt(
        &self,
        goal: &mut Goal,
        index: usize,
        request: &CommandRequest<'_>,
        history: &mut ChatHistory,
    ) -> Result<(), AttemptFailure> {
        let prompt = self.generator.run(self.model, request, history)?;
        goal.tasks[index].commands = prompt.commands.clone();
        if !prompt.nl_response.is_empty() {
            goal.log
                .push(format!("Task {}: {}", index + 1, prompt.nl_response));
        }

        if prompt.vision_needed {
            let analysis = self.analyze(goal, request.task)?;
            goal.log
                .push(format!("Task {}: vision: {analysis}", index + 1));
            history.push_assistant(analysis);
        }

        for command in &prompt.commands {
            check_command(command).map_err(AttemptFailure::Rejected)?;
        }

        let outputs = match self.config.dispatch {
            Dispatch::Sequential => prompt
                .commands
                .iter()
                .map(|command| execute_command(self.shell, command, self.config.shell_timeout))
                .collect::<Result<Vec<_>, _>>()?,
            Dispatch::Parallel => {
                execute_parallel(self.shell, &prompt.commands, self.config.shell_timeout)?
            }
        };
        for (command, output) in prompt.commands.iter().zip(&outputs) {
            goal.log.push(format!(
                "Task {}: ran `{command}`: {}",
                index + 1,
                excerpt(output)
            ));
        }
        Ok(())
    }

    fn analyze(&self, goal: &Goal, task: &str) -> Result<String, AttemptFailure> {
        if !goal.use_vision {
            return Err(AttemptFailure::VisionDisabled);
        }
        let Some(vision) = self.vision else {
            return Err(AttemptFailure::VisionUnavailable(
                "no vision client configured".to_string(),
            ));
        };
        if goal.images.is_empty() {
            return Err(AttemptFailure::VisionUnavailable(
                "no images were provided".to_string(),
            ));
        }
        debug!(images = goal.images.len(), "requesting vision analysis");
        vision
            .analyze(task, &goal.images)
            .map_err(AttemptFailure::Vision)
    }

    fn record(&self, goal: &Goal, index: usize) {
        let task = &goal.tasks[index];
        self.log.record(&AttemptRecord {
            goal: goal.description.clone(),
            task_index: index,
            description: task.description.clone(),
            attempt: task.attempt,
            status: task.status,
            commands: task.commands.clone(),
            feedback: task.feedback.clone(),
            recorded_at: AttemptRecord::now(),
        });
    }
}

/// Run one command and map its outcome to output text or a failure.
fn execute_command<S: Shell + ?Sized>(
    shell: &S,
    command: &str,
    timeout: Duration,
) -> Result<String, AttemptFailure> {
    debug!(command, "executing");
    match shell.run(command, timeout) {
        Ok(ShellOutcome::Success { output }) => Ok(output),
        Ok(ShellOutcome::Failed { code, output }) => Err(AttemptFailure::Command {
            command: command.to_string(),
            code,
            output: excerpt(&output),
        }),
        Ok(ShellOutcome::TimedOut { output }) => Err(AttemptFailure::Timeout {
            command: command.to_string(),
            secs: timeout.as_secs(),
            output: excerpt(&output),
        }),
        Err(err) => Err(AttemptFailure::Spawn {
            command: command.to_string(),
            error: format!("{err:#}"),
        }),
    }
}

/// Run every command on its own scoped thread. All commands run to
/// completion; the failure of the lowest-indexed command is reported.
fn execute_parallel<S: Shell + ?Sized>(
    shell: &S,
    commands: &[String],
    timeout: Duration,
) -> Result<Vec<String>, AttemptFailure> {
    let results = Mutex::new(Vec::with_capacity(commands.len()));
    thread::scope(|scope| {
        for (index, command) in commands.iter().enumerate() {
            let results = &results;
            scope.spawn(move || {
                let result = execute_command(shell, command, timeout);
                results
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((index, result));
            });
        }
    });

    let mut results = results.into_inner().unwrap_or_else(PoisonError::into_inner);
    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, result)| result).collect()
}

fn excerpt(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.chars().count() <= OUTPUT_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(OUTPUT_EXCERPT_CHARS).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Task;
    use crate::test_support::{
        ScriptedModel, ScriptedShell, ScriptedVision, failure, generator_config, success,
    };

    const LIST: &str = r#"{"nlResponse": "Listing", "commands": ["ls"]}"#;

    fn generator() -> CommandGenerator {
        CommandGenerator::new(generator_config(), String::new())
            .expect("generator")
            .with_home_dir(None)
    }

    fn goal_with_task(max_retries: u32) -> Goal {
        Goal::new("list things", false).with_tasks(vec![Task::new("List files", max_retries)])
    }

    #[test]
    fn successful_attempt_completes_the_task() {
        let model = ScriptedModel::new([Ok(LIST.to_string())]);
        let shell = ScriptedShell::always(success("a\nb"));
        let generator = generator();
        let log = ExecutionLog::in_memory();
        let executor = TaskExecutor::new(&model, &shell, &generator, &log, ExecutorConfig::default());

        let mut goal = goal_with_task(3);
        let status = executor.run_task(&mut goal, 0, &mut ChatHistory::new(8));

        assert_eq!(status, Some(TaskStatus::Completed));
        assert_eq!(goal.tasks[0].attempt, 1);
        assert_eq!(goal.tasks[0].commands, vec!["ls"]);
        assert_eq!(shell.executed(), vec!["ls"]);
        let records = log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, TaskStatus::Completed);
    }

    #[test]
    fn failure_output_is_fed_back_on_retry() {
        let model = ScriptedModel::repeating(LIST);
        let shell = ScriptedShell::sequence(vec![failure(1, "ls: denied"), success("ok")]);
        let generator = generator();
        let log = ExecutionLog::in_memory();
        let executor = TaskExecutor::new(&model, &shell, &generator, &log, ExecutorConfig::default());

        let mut goal = goal_with_task(3);
        let status = executor.run_task(&mut goal, 0, &mut ChatHistory::new(8));

        assert_eq!(status, Some(TaskStatus::Completed));
        assert_eq!(goal.tasks[0].attempt, 2);
        assert!(goal.tasks[0].feedback.is_empty());

        let second = model.requests().pop().expect("second request");
        assert!(second[0].content.contains("ls: denied"));
        assert_eq!(second.last().map(|m| m.content.as_str()), Some("Task: List files"));

        let statuses: Vec<TaskStatus> = log.records().iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![TaskStatus::InProgress, TaskStatus::Completed]);
    }

    #[test]
    fn attempts_stop_at_the_budget() {
        let model = ScriptedModel::repeating(LIST);
        let shell = ScriptedShell::always(failure(2, "nope"));
        let generator = generator();
        let log = ExecutionLog::in_memory();
        let executor = TaskExecutor::new(&model, &shell, &generator, &log, ExecutorConfig::default());

        let mut goal = goal_with_task(3);
        let status = executor.run_task(&mut goal, 0, &mut ChatHistory::new(8));

        assert_eq!(status, Some(TaskStatus::Failed));
        assert_eq!(goal.tasks[0].attempt, 3);
        assert_eq!(shell.executed().len(), 3);
        assert!(goal.tasks[0].feedback.contains("exit code 2"));
        assert_eq!(log.records().len(), 3);
    }

    #[test]
    fn vision_request_without_permission_runs_nothing() {
        let model = ScriptedModel::new([Ok(
            r#"{"commands": ["ls"], "visionNeeded": true}"#.to_string(),
        )]);
        let shell = ScriptedShell::succeeding();
        let generator = generator();
        let log = ExecutionLog::in_memory();
        let executor = TaskExecutor::new(&model, &shell, &generator, &log, ExecutorConfig::default());

        let mut goal = goal_with_task(1);
        let status = executor.run_task(&mut goal, 0, &mut ChatHistory::new(8));

        assert_eq!(status, Some(TaskStatus::Failed));
        assert_eq!(goal.tasks[0].feedback, "Vision model required but not enabled.");
        assert!(shell.executed().is_empty());
    }

    #[test]
    fn vision_answer_is_logged_and_kept_in_history() {
        let model = ScriptedModel::new([Ok(
            r#"{"commands": [], "visionNeeded": true}"#.to_string(),
        )]);
        let shell = ScriptedShell::succeeding();
        let vision = ScriptedVision::new([Ok("A login window".to_string())]);
        let generator = generator();
        let log = ExecutionLog::disabled();
        let executor = TaskExecutor::new(&model, &shell, &generator, &log, ExecutorConfig::default())
            .with_vision(Some(&vision));

        let mut goal = Goal::new("look", true)
            .with_tasks(vec![Task::new("Describe the screen", 1)])
            .with_images(vec!["cG5n".to_string()]);
        let mut history = ChatHistory::new(8);
        let status = executor.run_task(&mut goal, 0, &mut history);

        assert_eq!(status, Some(TaskStatus::Completed));
        assert_eq!(vision.calls(), vec![("Describe the screen".to_string(), 1)]);
        assert!(goal.log.iter().any(|line| line.contains("A login window")));
        assert_eq!(
            history.messages().last().map(|m| m.content.as_str()),
            Some("A login window")
        );
    }

    #[test]
    fn timeout_is_its_own_failure() {
        let model = ScriptedModel::repeating(LIST);
        let shell = ScriptedShell::always(ShellOutcome::TimedOut {
            output: String::new(),
        });
        let generator = generator();
        let log = ExecutionLog::disabled();
        let executor = TaskExecutor::new(&model, &shell, &generator, &log, ExecutorConfig::default());

        let mut goal = goal_with_task(1);
        executor.run_task(&mut goal, 0, &mut ChatHistory::new(8));
        assert!(goal.tasks[0].feedback.contains("timed out after 20s"));
    }

    #[test]
    fn parallel_dispatch_runs_every_command() {
        let model = ScriptedModel::new([Ok(
            r#"{"commands": ["echo a", "echo b", "echo c"]}"#.to_string(),
        )]);
        let shell = ScriptedShell::succeeding();
        let generator = generator();
        let log = ExecutionLog::disabled();
        let config = ExecutorConfig {
            dispatch: Dispatch::Parallel,
            ..ExecutorConfig::default()
        };
        let executor = TaskExecutor::new(&model, &shell, &generator, &log, config);

        let mut goal = goal_with_task(1);
        let status = executor.run_task(&mut goal, 0, &mut ChatHistory::new(8));

        assert_eq!(status, Some(TaskStatus::Completed));
        let mut executed = shell.executed();
        executed.sort();
        assert_eq!(executed, vec!["echo a", "echo b", "echo c"]);
    }

    #[test]
    fn parallel_failure_reports_the_first_command() {
        let results = execute_parallel(
            &ScriptedShell::always(failure(1, "boom")),
            &["first".to_string(), "second".to_string()],
            Duration::from_secs(1),
        );
        match results {
            Err(AttemptFailure::Command { command, .. }) => assert_eq!(command, "first"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn out_of_range_and_terminal_tasks_are_left_alone() {
        let model = ScriptedModel::repeating(LIST);
        let shell = ScriptedShell::succeeding();
        let generator = generator();
        let log = ExecutionLog::disabled();
        let executor = TaskExecutor::new(&model, &shell, &generator, &log, ExecutorConfig::default());

        let mut goal = goal_with_task(3);
        assert_eq!(executor.run_task(&mut goal, 5, &mut ChatHistory::new(8)), None);
        goal.tasks[0].status = TaskStatus::Completed;
        assert_eq!(
            executor.run_task(&mut goal, 0, &mut ChatHistory::new(8)),
            Some(TaskStatus::Completed)
        );
        assert!(model.requests().is_empty());
    }
}

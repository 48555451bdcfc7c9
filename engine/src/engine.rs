//! Goal engine: decomposes a goal and drives its tasks in order.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::agents::GeneratorConfig;
use crate::agents::command_generator::CommandGenerator;
use crate::agents::task_generator::TaskGenerator;
use crate::core::history::ChatHistory;
use crate::core::types::{Goal, GoalReport, Task, TaskStatus};
use crate::executor::{ExecutorConfig, TaskExecutor};
use crate::io::audit::ExecutionLog;
use crate::io::config::Settings;
use crate::io::model::ModelClient;
use crate::io::shell::Shell;
use crate::io::vision::VisionClient;

/// Everything the engine needs from settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub generator: GeneratorConfig,
    pub max_retries: u32,
    pub history_max_exchanges: usize,
    pub executor: ExecutorConfig,
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            generator: GeneratorConfig {
                model: settings.default_model.clone(),
                platform: settings.platform,
                prompt_budget_bytes: settings.prompt_budget_bytes,
            },
            max_retries: settings.max_retries,
            history_max_exchanges: settings.history_max_exchanges,
            executor: ExecutorConfig {
                shell_timeout: Duration::from_secs(settings.shell_timeout_secs),
                dispatch: settings.dispatch,
            },
        }
    }
}

/// Owns the generators and borrows the collaborators for one process.
pub struct GoalEngine<'a, M: ModelClient + ?Sized, S: Shell + ?Sized> {
    model: &'a M,
    shell: &'a S,
    vision: Option<&'a dyn VisionClient>,
    log: &'a ExecutionLog,
    config: EngineConfig,
    tasks: TaskGenerator,
    commands: CommandGenerator,
}

impl<'a, M: ModelClient + ?Sized, S: Shell + ?Sized> GoalEngine<'a, M, S> {
    /// `system_context` is the host summary embedded in every command prompt.
    pub fn new(
        model: &'a M,
        shell: &'a S,
        log: &'a ExecutionLog,
        config: EngineConfig,
        system_context: String,
    ) -> Result<Self> {
        let tasks = TaskGenerator::new(config.generator.clone(), config.max_retries)
            .context("build task generator")?;
        let commands = CommandGenerator::new(config.generator.clone(), system_context)
            .context("build command generator")?;
        Ok(Self {
            model,
            shell,
            vision: None,
            log,
            config,
            tasks,
            commands,
        })
    }

    pub fn with_vision(mut self, vision: Option<&'a dyn VisionClient>) -> Self {
        self.vision = vision;
        self
    }

    /// Replace the command generator, e.g. to pin the home directory.
    pub fn with_command_generator(mut self, commands: CommandGenerator) -> Self {
        self.commands = commands;
        self
    }

    pub fn new_history(&self) -> ChatHistory {
        ChatHistory::new(self.config.history_max_exchanges)
    }

    /// Decompose a goal description into pending tasks.
    pub fn plan(&self, description: &str, history: &mut ChatHistory) -> Result<Vec<Task>> {
        self.tasks
            .run(self.model, description, history)
            .context("generate tasks")
    }

    /// Run every non-terminal task of `goal` with a fresh chat history.
    pub fn run(&self, goal: &mut Goal) -> GoalReport {
        let mut history = self.new_history();
        self.run_with_history(goal, &mut history)
    }

    #[instrument(skip_all, fields(goal = %goal.description, tasks = goal.tasks.len()))]
    pub fn run_with_history(&self, goal: &mut Goal, history: &mut ChatHistory) -> GoalReport {
        if goal.tasks.is_empty() {
            info!("goal has no tasks");
            goal.log.push("Nothing to do.".to_string());
            return GoalReport::default();
        }

        let executor = TaskExecutor::new(
            self.model,
            self.shell,
            &self.commands,
            self.log,
            self.config.executor,
        )
        .with_vision(self.vision);

        while let Some(index) = goal
            .tasks
            .iter()
            .position(|task| !task.status.is_terminal())
        {
            match executor.run_task(goal, index, history) {
                Some(TaskStatus::Completed) => {}
                Some(status) => warn!(task = index, status = status.as_str(), "task did not complete"),
                None => break,
            }
        }

        let report = GoalReport::from_tasks(&goal.tasks);
        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            "goal finished"
        );
        goal.log.push(format!(
            "Goal finished: {} completed, {} failed",
            report.completed.len(),
            report.failed.len()
        ));
        report
    }

    /// Plan and run a goal from its description. Failing to produce a task
    /// list is the only error; task failures are reported in the report.
    pub fn run_description(
        &self,
        description: &str,
        use_vision: bool,
        images: Vec<String>,
    ) -> Result<(Goal, GoalReport)> {
        let mut goal = Goal::new(description.trim(), use_vision).with_images(images);
        let mut history = self.new_history();
        if goal.description.is_empty() {
            goal.log.push("Nothing to do.".to_string());
            return Ok((goal, GoalReport::default()));
        }

        goal.tasks = self.plan(&goal.description, &mut history)?;
        for (index, task) in goal.tasks.iter().enumerate() {
            goal.log
                .push(format!("Task {}: planned: {}", index + 1, task.description));
        }
        let report = self.run_with_history(&mut goal, &mut history);
        Ok((goal, report))
    }
}

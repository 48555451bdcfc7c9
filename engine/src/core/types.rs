//! Shared deterministic types for the goal engine.
//!
//! These types define the contracts between the generators, the task executor
//! and the goal engine. They carry no I/O and are cheap to clone in tests.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a single task.
///
/// `Pending -> InProgress -> {Completed | Failed}`. A retry re-enters
/// `InProgress` directly; a task never returns to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

/// One actionable step of a goal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub description: String,
    /// Commands produced by the latest generation. Replaced wholesale on retry.
    pub commands: Vec<String>,
    pub status: TaskStatus,
    /// Generation attempts made so far (1-indexed once started).
    pub attempt: u32,
    /// Total generation attempts allowed for this task.
    pub max_retries: u32,
    /// Failure text from the last attempt, fed back to the model.
    pub feedback: String,
    /// Indices of earlier tasks this one relies on. Informational only:
    /// tasks always run in list order.
    pub dependencies: Vec<usize>,
}

impl Task {
    pub fn new(description: impl Into<String>, max_retries: u32) -> Self {
        Self {
            description: description.into(),
            commands: Vec::new(),
            status: TaskStatus::Pending,
            attempt: 0,
            max_retries,
            feedback: String::new(),
            dependencies: Vec::new(),
        }
    }
}

/// A user objective and everything produced while pursuing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goal {
    pub description: String,
    pub tasks: Vec<Task>,
    /// Human-readable event log, appended on every task transition.
    pub log: Vec<String>,
    /// Whether tasks may call the vision collaborator.
    pub use_vision: bool,
    /// Base64-encoded images handed to the vision collaborator when a task asks for it.
    pub images: Vec<String>,
}

impl Goal {
    pub fn new(description: impl Into<String>, use_vision: bool) -> Self {
        Self {
            description: description.into(),
            tasks: Vec::new(),
            log: Vec::new(),
            use_vision,
            images: Vec::new(),
        }
    }

    pub fn with_tasks(mut self, tasks: Vec<Task>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    /// True once every task is `Completed`. An empty goal is trivially achieved.
    pub fn is_achieved(&self) -> bool {
        self.tasks
            .iter()
            .all(|task| task.status == TaskStatus::Completed)
    }
}

/// Structured result of one command-generation call.
///
/// Field names on the wire follow the prompt contract (`nlResponse`,
/// `commands`, `visionNeeded`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CombinedPrompt {
    #[serde(rename = "nlResponse", default)]
    pub nl_response: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(rename = "visionNeeded", default)]
    pub vision_needed: bool,
}

/// Terminal classification of a goal run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalOutcome {
    /// The goal produced no tasks.
    NothingToDo,
    /// Every task completed.
    Success,
    /// At least one task failed. Other tasks may still have completed.
    PartialFailure,
}

/// Aggregate result of a goal run, by task description.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct GoalReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
}

impl GoalReport {
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let mut report = GoalReport::default();
        for task in tasks {
            match task.status {
                TaskStatus::Completed => report.completed.push(task.description.clone()),
                TaskStatus::Failed => report.failed.push(task.description.clone()),
                TaskStatus::Pending | TaskStatus::InProgress => {}
            }
        }
        report
    }

    pub fn outcome(&self) -> GoalOutcome {
        if !self.failed.is_empty() {
            GoalOutcome::PartialFailure
        } else if self.completed.is_empty() {
            GoalOutcome::NothingToDo
        } else {
            GoalOutcome::Success
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

//! Scripted collaborators for deterministic tests.
//!
//! Each double replays a queue of canned results and records what it was
//! asked, so tests can assert on both sides of the conversation.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::agents::GeneratorConfig;
use crate::core::history::ChatMessage;
use crate::io::config::Platform;
use crate::io::model::{ChatRequest, ModelClient, ModelError};
use crate::io::shell::{Shell, ShellOutcome};
use crate::io::system_info::{SystemInfo, SystemInfoProvider};
use crate::io::vision::VisionClient;

/// Generator settings used across tests: macOS prompts, generous budget.
pub fn generator_config() -> GeneratorConfig {
    GeneratorConfig {
        model: "scripted".to_string(),
        platform: Platform::Macos,
        prompt_budget_bytes: 16_000,
    }
}

/// Model backend that replays queued replies in order.
pub struct ScriptedModel {
    replies: RefCell<VecDeque<Result<String, ModelError>>>,
    fallback: Option<String>,
    requests: RefCell<Vec<Vec<ChatMessage>>>,
    formats: RefCell<Vec<Option<String>>>,
}

impl ScriptedModel {
    pub fn new<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = Result<String, ModelError>>,
    {
        Self {
            replies: RefCell::new(replies.into_iter().collect()),
            fallback: None,
            requests: RefCell::new(Vec::new()),
            formats: RefCell::new(Vec::new()),
        }
    }

    /// Answer every request with `reply`.
    pub fn repeating(reply: impl Into<String>) -> Self {
        Self {
            replies: RefCell::new(VecDeque::new()),
            fallback: Some(reply.into()),
            requests: RefCell::new(Vec::new()),
            formats: RefCell::new(Vec::new()),
        }
    }

    /// Append replies served after the current queue.
    pub fn then(self, replies: impl IntoIterator<Item = Result<String, ModelError>>) -> Self {
        self.replies.borrow_mut().extend(replies);
        self
    }

    /// Messages of every request received so far, oldest first.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.borrow().clone()
    }

    /// Requested output format of every request, oldest first.
    pub fn formats(&self) -> Vec<Option<String>> {
        self.formats.borrow().clone()
    }
}

impl ModelClient for ScriptedModel {
    fn chat(&self, request: &ChatRequest<'_>) -> Result<String, ModelError> {
        self.requests.borrow_mut().push(request.messages.to_vec());
        self.formats
            .borrow_mut()
            .push(request.format.map(str::to_string));
        if let Some(reply) = self.replies.borrow_mut().pop_front() {
            return reply;
        }
        self.fallback
            .clone()
            .ok_or_else(|| ModelError::Unavailable("scripted model has no more replies".into()))
    }
}

/// Shell that replays outcomes and records every command it was given.
pub struct ScriptedShell {
    outcomes: Mutex<VecDeque<ShellOutcome>>,
    fallback: Option<ShellOutcome>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedShell {
    /// Return `outcome` for every command.
    pub fn always(outcome: ShellOutcome) -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            fallback: Some(outcome),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Return each outcome once, in order. Running past the end is an error.
    pub fn sequence(outcomes: Vec<ShellOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            fallback: None,
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::always(success(""))
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Shell for ScriptedShell {
    fn run(&self, command: &str, _timeout: Duration) -> Result<ShellOutcome> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.to_string());
        let next = self
            .outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        next.or_else(|| self.fallback.clone())
            .ok_or_else(|| anyhow!("scripted shell has no outcome for `{command}`"))
    }
}

pub fn success(output: &str) -> ShellOutcome {
    ShellOutcome::Success {
        output: output.to_string(),
    }
}

pub fn failure(code: i32, output: &str) -> ShellOutcome {
    ShellOutcome::Failed {
        code: Some(code),
        output: output.to_string(),
    }
}

/// Vision collaborator that replays queued answers.
pub struct ScriptedVision {
    answers: RefCell<VecDeque<Result<String, ModelError>>>,
    calls: RefCell<Vec<(String, usize)>>,
}

impl ScriptedVision {
    pub fn new<I>(answers: I) -> Self
    where
        I: IntoIterator<Item = Result<String, ModelError>>,
    {
        Self {
            answers: RefCell::new(answers.into_iter().collect()),
            calls: RefCell::new(Vec::new()),
        }
    }

    /// `(prompt, image count)` for every call.
    pub fn calls(&self) -> Vec<(String, usize)> {
        self.calls.borrow().clone()
    }
}

impl VisionClient for ScriptedVision {
    fn analyze(&self, prompt: &str, images: &[String]) -> Result<String, ModelError> {
        self.calls
            .borrow_mut()
            .push((prompt.to_string(), images.len()));
        self.answers
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Unavailable("scripted vision has no more answers".into())))
    }
}

/// System-info provider returning a fixed snapshot.
pub struct StaticSystemInfo(pub Option<SystemInfo>);

impl SystemInfoProvider for StaticSystemInfo {
    fn snapshot(&self) -> Option<SystemInfo> {
        self.0.clone()
    }
}

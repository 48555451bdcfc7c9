//! Model-driven generators: goal decomposition and per-task command generation.

use thiserror::Error;

use crate::core::repair::ParseError;
use crate::core::validator::Rejection;
use crate::io::config::Platform;
use crate::io::model::ModelError;

pub mod command_generator;
pub mod task_generator;

/// Settings shared by both generators.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Model name sent with every request.
    pub model: String,
    pub platform: Platform,
    pub prompt_budget_bytes: usize,
}

/// Why a generation call produced nothing usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerateError {
    #[error("model backend failed: {0}")]
    Backend(#[from] ModelError),

    #[error("could not parse model output: {0}")]
    Parse(#[from] ParseError),

    #[error("model output has the wrong shape: {reason}")]
    Malformed { raw: String, reason: String },

    #[error("model returned no {0}")]
    Empty(&'static str),

    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error("prompt rendering failed: {0}")]
    Prompt(String),
}

impl GenerateError {
    /// The raw model reply, when the failure came from interpreting one.
    pub fn raw_reply(&self) -> Option<&str> {
        match self {
            GenerateError::Parse(err) => Some(&err.raw),
            GenerateError::Malformed { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

pub(crate) fn prompt_error(err: &anyhow::Error) -> GenerateError {
    GenerateError::Prompt(format!("{err:#}"))
}

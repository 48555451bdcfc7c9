//! Goal/task execution engine.
//!
//! A language model decomposes a natural-language goal into tasks and turns
//! each task into OS commands. The engine repairs the model's output, checks
//! every command against a safety policy, runs it through the host shell, and
//! retries with failure feedback until the goal is achieved or the attempts
//! run out.
//!
//! - **[`core`]**: Pure, deterministic logic (validation, repair, parsing,
//!   normalization, chat history, domain types). No I/O.
//! - **[`io`]**: Collaborators with side effects (model and vision backends,
//!   shell, host information, settings, execution log). Each sits behind a
//!   trait so tests can script it.
//!
//! Orchestration lives in [`agents`] (model-driven generators), [`executor`]
//! (one task's retry loop) and [`engine`] (a whole goal).

pub mod agents;
pub mod core;
pub mod engine;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

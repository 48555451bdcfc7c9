//! Deterministic, pure logic shared by the goal engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod history;
pub mod normalizer;
pub mod repair;
pub mod reply;
pub mod types;
pub mod validator;

//! Side-effecting collaborators: model server, shell, host info, settings and logs.

pub mod audit;
pub mod config;
pub mod model;
pub mod process;
pub mod prompt;
pub mod shell;
pub mod system_info;
pub mod vision;

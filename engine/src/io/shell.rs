//! Shell collaborator: runs one command string on the host.

use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, instrument};

use crate::io::config::Platform;
use crate::io::process::run_command_with_timeout;

/// Environment variables passed through to commands. Everything else is cleared.
const SAFE_ENV_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "SHELL", "LANG", "LC_ALL", "TMPDIR", "TEMP", "TMP", "PWD", "OLDPWD",
    "SYSTEMROOT", "USERPROFILE", "APPDATA", "DISPLAY", "WAYLAND_DISPLAY", "XDG_RUNTIME_DIR",
];

/// Result of running one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellOutcome {
    Success { output: String },
    Failed { code: Option<i32>, output: String },
    TimedOut { output: String },
}

impl ShellOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ShellOutcome::Success { .. })
    }

    pub fn output(&self) -> &str {
        match self {
            ShellOutcome::Success { output }
            | ShellOutcome::Failed { output, .. }
            | ShellOutcome::TimedOut { output } => output,
        }
    }
}

/// Runs command strings. `Err` means the command could not be started at all.
pub trait Shell: Send + Sync {
    fn run(&self, command: &str, timeout: Duration) -> Result<ShellOutcome>;
}

/// Runs commands through the host shell (`/bin/sh -c` or `cmd /C`) with a
/// reduced environment.
#[derive(Debug, Clone)]
pub struct SystemShell {
    platform: Platform,
    output_limit_bytes: usize,
}

impl SystemShell {
    pub fn new(platform: Platform, output_limit_bytes: usize) -> Self {
        Self {
            platform,
            output_limit_bytes,
        }
    }

    fn command(&self, command: &str) -> Command {
        let mut cmd = match self.platform {
            Platform::Windows => {
                let mut cmd = Command::new("cmd");
                cmd.arg("/C").arg(command);
                cmd
            }
            Platform::Macos | Platform::Linux => {
                let mut cmd = Command::new("/bin/sh");
                cmd.arg("-c").arg(command);
                cmd
            }
        };
        cmd.env_clear();
        for key in SAFE_ENV_VARS {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd
    }
}

impl Shell for SystemShell {
    #[instrument(skip_all, fields(command = %command))]
    fn run(&self, command: &str, timeout: Duration) -> Result<ShellOutcome> {
        let output =
            run_command_with_timeout(self.command(command), timeout, self.output_limit_bytes)?;
        let text = output.combined_text();
        let outcome = if output.timed_out {
            ShellOutcome::TimedOut { output: text }
        } else if output.status.success() {
            ShellOutcome::Success { output: text }
        } else {
            ShellOutcome::Failed {
                code: output.status.code(),
                output: text,
            }
        };
        debug!(success = outcome.is_success(), "shell command finished");
        Ok(outcome)
    }
}

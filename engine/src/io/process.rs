//! Child process execution with a timeout and bounded output capture.

use std::io::{ErrorKind, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Minimum time given to readers to reach EOF after the child exits.
const MIN_DRAIN: Duration = Duration::from_millis(100);
/// Time given to readers to reach EOF after the process group was killed.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Stdout followed by stderr as lossy UTF-8, with truncation notices.
    pub fn combined_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            text.push_str(&format!(
                "\n[stdout truncated {} bytes]",
                self.stdout_truncated
            ));
        }
        let stderr = String::from_utf8_lossy(&self.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        if self.stderr_truncated > 0 {
            text.push_str(&format!(
                "\n[stderr truncated {} bytes]",
                self.stderr_truncated
            ));
        }
        text.trim().to_string()
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
///
/// On unix the child leads its own process group. When the deadline passes, the whole group is
/// killed and the result has `timed_out` set. That also covers descendants still holding the
/// output pipes after the child itself exited (background jobs, pipeline stages).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let deadline = Instant::now() + timeout;
    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (done_tx, done_rx) = mpsc::channel();
    let stdout_capture = spawn_reader(stdout, output_limit_bytes, done_tx.clone());
    let stderr_capture = spawn_reader(stderr, output_limit_bytes, done_tx);

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing its process group"
            );
            timed_out = true;
            kill_process_group(&mut child);
            child.wait().context("wait command after kill")?
        }
    };

    let mut open_streams = 2;
    while open_streams > 0 {
        let wait = if timed_out {
            KILL_GRACE
        } else {
            deadline
                .saturating_duration_since(Instant::now())
                .max(MIN_DRAIN)
        };
        match done_rx.recv_timeout(wait) {
            Ok(()) => open_streams -= 1,
            Err(RecvTimeoutError::Timeout) if !timed_out => {
                warn!("output still open after the command exited, killing its process group");
                timed_out = true;
                kill_process_group(&mut child);
            }
            Err(_) => {
                warn!(open_streams, "output readers did not finish, keeping partial output");
                break;
            }
        }
    }

    let (stdout, stdout_truncated) = take_capture(&stdout_capture);
    let (stderr, stderr_truncated) = take_capture(&stderr_capture);

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Bytes kept so far and bytes discarded past the limit.
#[derive(Default)]
struct Capture {
    kept: Vec<u8>,
    truncated: usize,
}

type SharedCapture = Arc<Mutex<Capture>>;

/// Drain `reader` on its own thread into a shared buffer. `done` fires at EOF or on a read error.
fn spawn_reader<R: Read + Send + 'static>(
    mut reader: R,
    limit: usize,
    done: mpsc::Sender<()>,
) -> SharedCapture {
    let capture = SharedCapture::default();
    let shared = Arc::clone(&capture);
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(err = %err, "read output");
                    break;
                }
            };
            let mut capture = shared.lock().unwrap_or_else(PoisonError::into_inner);
            let keep = n.min(limit.saturating_sub(capture.kept.len()));
            capture.kept.extend_from_slice(&chunk[..keep]);
            capture.truncated += n - keep;
        }
        // The receiver is gone once the caller stopped waiting.
        let _ = done.send(());
    });
    capture
}

fn take_capture(capture: &SharedCapture) -> (Vec<u8>, usize) {
    let mut capture = capture.lock().unwrap_or_else(PoisonError::into_inner);
    (std::mem::take(&mut capture.kept), capture.truncated)
}

/// Kill the child and everything in its process group.
#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(child.id()) else {
        warn!(pid = child.id(), "pid out of range, killing the child only");
        if let Err(err) = child.kill() {
            warn!(err = %err, "kill command");
        }
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(err = %err, pgid, "kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill command");
    }
}

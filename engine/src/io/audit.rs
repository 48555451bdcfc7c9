//! Execution log: one JSON line per task attempt.
//!
//! The log is product output, separate from `tracing` diagnostics. Recording
//! never fails the caller: I/O errors are reported with `warn!` and dropped.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::types::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub goal: String,
    pub task_index: usize,
    pub description: String,
    pub attempt: u32,
    /// Task status after this attempt (`in_progress` when a retry follows).
    pub status: TaskStatus,
    pub commands: Vec<String>,
    pub feedback: String,
    /// RFC 3339 UTC timestamp.
    pub recorded_at: String,
}

impl AttemptRecord {
    pub fn now() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

enum Sink {
    File(BufWriter<File>),
    Memory(Vec<AttemptRecord>),
    Disabled,
}

/// Shared, append-only attempt log.
pub struct ExecutionLog {
    sink: Mutex<Sink>,
}

impl ExecutionLog {
    /// Append to a JSONL file, creating it and its parent directory if needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open execution log {}", path.display()))?;
        Ok(Self::with_sink(Sink::File(BufWriter::new(file))))
    }

    /// Keep records in memory; read them back with [`ExecutionLog::records`].
    pub fn in_memory() -> Self {
        Self::with_sink(Sink::Memory(Vec::new()))
    }

    pub fn disabled() -> Self {
        Self::with_sink(Sink::Disabled)
    }

    fn with_sink(sink: Sink) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    pub fn record(&self, record: &AttemptRecord) {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *sink {
            Sink::File(writer) => {
                if let Err(err) = write_line(writer, record) {
                    warn!(err = %format!("{err:#}"), "failed to write execution log record");
                }
            }
            Sink::Memory(records) => records.push(record.clone()),
            Sink::Disabled => {}
        }
    }

    /// Records kept by an in-memory log. Empty for other sinks.
    pub fn records(&self) -> Vec<AttemptRecord> {
        match &*self.sink.lock().unwrap_or_else(PoisonError::into_inner) {
            Sink::Memory(records) => records.clone(),
            Sink::File(_) | Sink::Disabled => Vec::new(),
        }
    }
}

fn write_line(writer: &mut BufWriter<File>, record: &AttemptRecord) -> Result<()> {
    let line = serde_json::to_string(record).context("serialize attempt record")?;
    writeln!(writer, "{line}").context("write attempt record")?;
    writer.flush().context("flush execution log")
}

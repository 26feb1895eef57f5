//! Diagnostics and the structured event log
//!
//! Two outputs exist:
//!
//! - Human-readable `[LOCKDEP] ...` lines on stderr. Denials are always
//!   printed; per-operation lines only in verbose mode.
//! - An optional JSON-lines event log. Entries are handed to a background
//!   writer thread over a channel so the engine critical section only pays for
//!   a channel send.

use crate::core::config;
use crate::core::types::{Events, LockAddr, LockKind, ThreadId};
use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const PREFIX: &str = "[LOCKDEP]";

/// Print a diagnostic line unconditionally
pub fn diag(args: fmt::Arguments<'_>) {
    eprintln!("{PREFIX} {args}");
}

/// Print a diagnostic line in verbose mode only
pub fn verbose(args: fmt::Arguments<'_>) {
    if config::is_verbose() {
        diag(args);
    }
}

/// One line of the event log
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LogEntry {
    /// Thread that performed the operation
    pub thread_id: ThreadId,
    /// Lock (or condition variable) the operation was about
    pub lock: LockAddr,
    /// Recorded type of `lock`, when the engine knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<LockKind>,
    /// Type of event that occurred
    pub event: Events,
    /// The mutex released by a condvar wait, or the held lock of a denial
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<LockAddr>,
    /// Ordering path that made a denial necessary
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cycle: Vec<LockAddr>,
    /// Seconds since the Unix epoch, microsecond precision
    pub timestamp: f64,
}

impl LogEntry {
    pub fn new(thread_id: ThreadId, lock: LockAddr, kind: Option<LockKind>, event: Events) -> Self {
        let now = Utc::now();
        LogEntry {
            thread_id,
            lock,
            kind,
            event,
            peer: None,
            cycle: Vec::new(),
            timestamp: now.timestamp() as f64 + now.timestamp_subsec_micros() as f64 / 1_000_000.0,
        }
    }

    pub fn with_peer(mut self, peer: LockAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_cycle(mut self, cycle: Vec<LockAddr>) -> Self {
        self.cycle = cycle;
        self
    }
}

/// Commands for controlling the async logger thread
#[derive(Debug)]
enum LoggerCommand {
    /// Write a log entry to the file
    Entry(LogEntry),
    /// Flush all pending entries to disk and signal completion
    Flush(Sender<()>),
}

/// Asynchronous JSON-lines writer for engine events
pub struct EventLogger {
    sender: Sender<LoggerCommand>,
    path: PathBuf,
}

impl EventLogger {
    /// Create a logger writing to `path`
    ///
    /// A `{timestamp}` placeholder in the file name is replaced with the
    /// current time. Missing parent directories are created and an existing
    /// file is truncated.
    ///
    /// # Errors
    /// Returns an error if the directory or the file cannot be created
    pub fn with_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = path.as_ref().to_string_lossy();
        #[allow(clippy::literal_string_with_formatting_args)]
        let path = if raw.contains("{timestamp}") {
            let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
            PathBuf::from(raw.replace("{timestamp}", &timestamp))
        } else {
            path.as_ref().to_path_buf()
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;

        let (tx, rx) = unbounded::<LoggerCommand>();
        thread::Builder::new()
            .name("lockdep-logger".into())
            .spawn(move || writer_thread(file, rx))
            .context("Failed to spawn logger thread")?;

        Ok(EventLogger { sender: tx, path })
    }

    /// Path of the file being written
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue an entry; never blocks
    pub fn log(&self, entry: LogEntry) {
        if let Err(e) = self.sender.send(LoggerCommand::Entry(entry)) {
            diag(format_args!("failed to queue log entry: {e}"));
        }
    }

    /// Block until every queued entry is on disk
    ///
    /// # Errors
    /// Returns an error if the writer thread is gone or does not answer in time
    pub fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        self.sender
            .send(LoggerCommand::Flush(done_tx))
            .map_err(|_| anyhow!("Logger thread has stopped"))?;
        done_rx
            .recv_timeout(Duration::from_secs(10))
            .map_err(|_| anyhow!("Flush operation timed out"))
    }
}

impl Drop for EventLogger {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            diag(format_args!("failed to flush event log on drop: {e:#}"));
        }
    }
}

fn writer_thread(file: File, rx: Receiver<LoggerCommand>) {
    let mut writer = BufWriter::new(file);

    while let Ok(cmd) = rx.recv() {
        match cmd {
            LoggerCommand::Entry(entry) => {
                if let Ok(json) = serde_json::to_string(&entry)
                    && let Err(e) = writeln!(writer, "{json}")
                {
                    diag(format_args!("log write error: {e}"));
                }
            }
            LoggerCommand::Flush(done) => {
                if let Err(e) = writer.flush() {
                    diag(format_args!("log flush error: {e}"));
                }
                let _ = done.send(());
            }
        }
    }

    if let Err(e) = writer.flush() {
        diag(format_args!("final log flush error: {e}"));
    }
}

/// Parse a JSON-lines event log, skipping blank lines
///
/// # Errors
/// Returns an error naming the first line that is not a valid entry
pub fn read_log<P: AsRef<Path>>(path: P) -> Result<Vec<LogEntry>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read log file {}", path.display()))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("Invalid log entry on line {}", n + 1))
        })
        .collect()
}

//! Index progress reporting.
//!
//! Reports observable progress during `chx index` and `chx reconcile` so
//! users see what is being walked, how much is left, and what failed.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::{IsTerminal, Write};

/// A single progress event for an index run.
#[derive(Clone, Debug)]
pub enum IndexProgressEvent {
    /// Walking the directory tree. Total unknown.
    Discovering { root: String },
    /// `n` files handled out of `total`.
    Indexing { path: String, n: u64, total: u64 },
    /// A file produced a per-file error.
    FileFailed { path: String, reason: String },
}

/// Receives progress events from the indexing pipeline.
pub trait IndexProgressReporter: Send + Sync {
    fn report(&self, event: IndexProgressEvent);
}

/// Human-friendly progress on stderr: "index  1,234 / 5,000 files".
pub struct StderrProgress;

impl IndexProgressReporter for StderrProgress {
    fn report(&self, event: IndexProgressEvent) {
        let line = match &event {
            IndexProgressEvent::Discovering { root } => format!("index {}  discovering...\n", root),
            IndexProgressEvent::Indexing { n, total, .. } => {
                // Every file would flood the terminal; report in steps.
                if *n != *total && n % 100 != 0 {
                    return;
                }
                format!("index  {} / {} files\n", format_number(*n), format_number(*total))
            }
            IndexProgressEvent::FileFailed { path, reason } => {
                format!("index  skipped {}: {}\n", path, reason)
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IndexProgressReporter for JsonProgress {
    fn report(&self, event: IndexProgressEvent) {
        let obj = match &event {
            IndexProgressEvent::Discovering { root } => serde_json::json!({
                "event": "progress",
                "phase": "discovering",
                "root": root
            }),
            IndexProgressEvent::Indexing { path, n, total } => serde_json::json!({
                "event": "progress",
                "phase": "indexing",
                "path": path,
                "n": n,
                "total": total
            }),
            IndexProgressEvent::FileFailed { path, reason } => serde_json::json!({
                "event": "file_error",
                "path": path,
                "reason": reason
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IndexProgressReporter for NoProgress {
    fn report(&self, _event: IndexProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a terminal, otherwise off.
    pub fn default_for_tty() -> Self {
        if std::io::stderr().is_terminal() {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn IndexProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

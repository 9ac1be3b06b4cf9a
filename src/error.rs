//! Typed errors for the seams where callers need to branch on the failure.
//!
//! Application plumbing uses `anyhow::Result`. The types here are the ones
//! that cross a stage boundary as data:
//!
//! - [`FileError`]: a per-file indexing failure, collected into run summaries.
//! - [`QueueError`]: a unit of work submitted to a store's write queue failed.
//! - [`SearchError`]: a search or bundle request was rejected before producing results.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Why a single file could not be indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileErrorKind {
    TooLarge,
    Ignored,
    NoParser,
    ParseFailed,
    ReadFailed,
    WriteFailed,
}

impl FileErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileErrorKind::TooLarge => "too_large",
            FileErrorKind::Ignored => "ignored",
            FileErrorKind::NoParser => "no_parser",
            FileErrorKind::ParseFailed => "parse_failed",
            FileErrorKind::ReadFailed => "read_failed",
            FileErrorKind::WriteFailed => "write_failed",
        }
    }
}

/// Structured per-file error record. Never propagated as `Err` from a
/// directory run; collected into [`IndexSummary::errors`](crate::indexer::IndexSummary).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileError {
    pub path: String,
    pub kind: FileErrorKind,
    pub message: String,
}

impl FileError {
    pub fn new(path: impl Into<String>, kind: FileErrorKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.path, self.kind.as_str(), self.message)
    }
}

/// Failure of one unit of work on a store's write queue.
///
/// Only the submitter of the failing unit sees this; later units still run.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("write queue for {store} is closed")]
    Closed { store: &'static str },

    #[error("write on {store} panicked before completing")]
    Panicked { store: &'static str },

    #[error("write on {store} failed: {source}")]
    Failed {
        store: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// A rejected search request. No partial results accompany it.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("query must not be empty")]
    EmptyQuery,

    #[error("unknown entity type '{0}'. Expected one of: component, task, note, rule")]
    UnknownEntityType(String),

    #[error("malformed query: {0}")]
    MalformedQuery(String),

    #[error("unknown documentation bundle '{0}'")]
    UnknownBundle(String),

    #[error("invalid documentation bundle id '{0}'")]
    InvalidBundleId(String),

    #[error("limit must be >= 1")]
    InvalidLimit,
}

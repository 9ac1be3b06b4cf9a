//! Typed CRUD and lookup over the two stores.
//!
//! Repositories are cheap handles around an `Arc<StorageCoordinator>`.
//! Every mutating method goes through the owning store's write queue;
//! reads use the pool directly.
//!
//! | Repository | Store | Tables |
//! |------------|-------|--------|
//! | [`ComponentRepository`] | code | `components` |
//! | [`RelationshipRepository`] | code | `relationships` |
//! | [`FileRepository`] | code | `files` + per-file graph replacement |
//! | [`EmbeddingRepository`] | both | `embeddings` |
//! | [`TaskRepository`] | meta | `tasks`, `entity_links`, `tags` |
//! | [`NoteRepository`] | meta | `notes`, `entity_links`, `tags` |
//! | [`RuleRepository`] | meta | `rules`, `entity_links`, `tags` |

pub mod components;
pub mod embeddings;
pub mod files;
pub mod links;
pub mod notes;
pub mod relationships;
pub mod rules;
pub mod tasks;

pub use components::ComponentRepository;
pub use embeddings::EmbeddingRepository;
pub use files::{FileGraphWrite, FileRepository};
pub use notes::NoteRepository;
pub use relationships::RelationshipRepository;
pub use rules::RuleRepository;
pub use tasks::TaskRepository;

use crate::error::QueueError;

/// Flatten a queue outcome into `anyhow`, for callers that don't branch on it.
pub(crate) fn queued<T>(result: Result<T, QueueError>) -> anyhow::Result<T> {
    result.map_err(anyhow::Error::from)
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn string_list(json: &str) -> Vec<String> {
    serde_json::from_str(json).unwrap_or_default()
}

pub(crate) fn json_value(json: &str) -> serde_json::Value {
    serde_json::from_str(json).unwrap_or(serde_json::json!({}))
}

/// Escape `%`, `_` and `\` for use inside a `LIKE ... ESCAPE '\'` pattern.
pub(crate) fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

/// Score a text field against a query for lexical retrieval.
///
/// Exact (case-insensitive) match scores 1.0, prefix 0.8, whole-query
/// substring 0.6, otherwise the fraction of query terms present scaled
/// into `[0, 0.5]`.
pub fn lexical_score(query: &str, fields: &[&str]) -> f64 {
    let q = query.trim().to_lowercase();
    if q.is_empty() {
        return 0.0;
    }
    let terms: Vec<&str> = q.split_whitespace().collect();
    let mut best = 0.0f64;
    for field in fields {
        let f = field.to_lowercase();
        let score = if f == q {
            1.0
        } else if f.starts_with(&q) {
            0.8
        } else if f.contains(&q) {
            0.6
        } else {
            let hits = terms.iter().filter(|t| f.contains(*t)).count();
            0.5 * hits as f64 / terms.len() as f64
        };
        best = best.max(score);
    }
    best
}

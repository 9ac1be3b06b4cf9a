//! Attached documentation bundles.
//!
//! A bundle is a single SQLite file produced elsewhere, holding:
//!
//! ```text
//! library_info(name, version, source_url)
//! documents(title, content, section_type, url, embedding BLOB)
//! ```
//!
//! Attaching copies the file into the bundle directory as `<id>.sqlite`,
//! where the id is `name@version`, or `docs.<name>` for a combined bundle
//! (several libraries in one file, or no version). Bundles are only ever
//! opened read-only.

pub mod query;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::connect_read_only;
use crate::embedding::{blob_to_vec, cosine_similarity, embed_query, EmbeddingBackend};
use crate::error::SearchError;
use crate::repository::lexical_score;
use query::BooleanQuery;

const BUNDLE_EXT: &str = "sqlite";
const HIGHLIGHT_CHARS: usize = 200;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BundleInfo {
    pub id: String,
    pub name: String,
    pub version: Option<String>,
    pub source_url: Option<String>,
    pub document_count: i64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocHit {
    pub bundle_id: String,
    pub title: String,
    pub section_type: Option<String>,
    pub url: Option<String>,
    pub score: f64,
    pub highlights: Vec<String>,
}

pub struct DocsLibrary {
    dir: PathBuf,
    highlight_sentences: usize,
    backend: Arc<dyn EmbeddingBackend>,
}

impl DocsLibrary {
    pub fn new(dir: &Path, highlight_sentences: usize, backend: Arc<dyn EmbeddingBackend>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            highlight_sentences,
            backend,
        }
    }

    /// Copy the bundle at `source` into the bundle directory, replacing any
    /// bundle with the same id.
    pub async fn attach_bundle(&self, source: &Path) -> Result<BundleInfo> {
        let (name, version, source_url, libraries) = {
            let pool = connect_read_only(source).await?;
            let info = read_library_info(&pool).await;
            pool.close().await;
            info?
        };

        let id = bundle_id(&name, version.as_deref(), libraries, source);
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create bundle directory {}", self.dir.display()))?;
        let dest = self.bundle_path(&id)?;
        std::fs::copy(source, &dest).with_context(|| {
            format!("Failed to copy {} to {}", source.display(), dest.display())
        })?;
        info!(bundle = %id, path = %dest.display(), "attached documentation bundle");

        self.describe(&id, &dest).await
    }

    pub async fn list_bundles(&self) -> Result<Vec<BundleInfo>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to read bundle directory"),
        };

        let mut bundles = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BUNDLE_EXT) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match self.describe(&id, &path).await {
                Ok(info) => bundles.push(info),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable bundle"),
            }
        }
        bundles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(bundles)
    }

    /// Remove an attached bundle. Returns whether it existed.
    pub async fn detach_bundle(&self, id: &str) -> Result<bool> {
        let path = self.bundle_path(id)?;
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)
            .with_context(|| format!("Failed to remove bundle {}", path.display()))?;
        info!(bundle = id, "detached documentation bundle");
        Ok(true)
    }

    /// Rank documents across bundles by cosine similarity, then apply the
    /// boolean filter to the candidate set. `bundle_ids` empty means all.
    pub async fn search_docs(
        &self,
        query: &str,
        bundle_ids: &[String],
        limit: usize,
    ) -> Result<Vec<DocHit>> {
        if limit == 0 {
            return Err(SearchError::InvalidLimit.into());
        }
        let boolean = BooleanQuery::parse(query)?;

        let targets: Vec<String> = if bundle_ids.is_empty() {
            self.list_bundles().await?.into_iter().map(|b| b.id).collect()
        } else {
            for id in bundle_ids {
                if !self.bundle_path(id)?.exists() {
                    return Err(SearchError::UnknownBundle(id.clone()).into());
                }
            }
            bundle_ids.to_vec()
        };

        let semantic = boolean.semantic_text(query);
        let query_vec = if self.backend.dims() > 0 {
            match embed_query(self.backend.as_ref(), &semantic).await {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(error = %e, "query embedding failed, ranking docs lexically");
                    None
                }
            }
        } else {
            None
        };

        let mut scored = Vec::new();
        for id in &targets {
            let pool = connect_read_only(&self.bundle_path(id)?).await?;
            let rows = sqlx::query("SELECT title, content, section_type, url, embedding FROM documents")
                .fetch_all(&pool)
                .await;
            pool.close().await;

            for row in rows? {
                let title: String = row.get("title");
                let content: String = row.get("content");
                let score = match (&query_vec, row.get::<Option<Vec<u8>>, _>("embedding")) {
                    (Some(qv), Some(blob)) => cosine_similarity(qv, &blob_to_vec(&blob)) as f64,
                    _ => lexical_score(&semantic, &[title.as_str(), content.as_str()]),
                };
                scored.push((id.clone(), row, title, content, score));
            }
        }

        scored.sort_by(|a, b| b.4.partial_cmp(&a.4).unwrap_or(Ordering::Equal));
        scored.truncate(candidate_pool(limit));

        let terms = boolean.positive_terms();
        let mut hits = Vec::new();
        for (bundle_id, row, title, content, score) in scored {
            if hits.len() == limit {
                break;
            }
            if !boolean.matches(&format!("{}\n{}", title, content)) {
                continue;
            }
            hits.push(DocHit {
                bundle_id,
                highlights: highlights(&content, &terms, self.highlight_sentences),
                section_type: row.get("section_type"),
                url: row.get("url"),
                title,
                score,
            });
        }
        debug!(query, bundles = targets.len(), hits = hits.len(), "docs search finished");
        Ok(hits)
    }

    /// Path of bundle `id` inside the bundle directory. Ids that could
    /// name a file elsewhere are rejected.
    fn bundle_path(&self, id: &str) -> Result<PathBuf, SearchError> {
        if !is_valid_bundle_id(id) {
            return Err(SearchError::InvalidBundleId(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.{}", id, BUNDLE_EXT)))
    }

    async fn describe(&self, id: &str, path: &Path) -> Result<BundleInfo> {
        let pool = connect_read_only(path).await?;
        let info = read_library_info(&pool).await;
        let count: Result<i64, sqlx::Error> = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&pool)
            .await;
        pool.close().await;

        let (name, version, source_url, _) = info?;
        Ok(BundleInfo {
            id: id.to_string(),
            name,
            version,
            source_url,
            document_count: count?,
            path: path.to_path_buf(),
        })
    }
}

/// Similarity candidates kept before the boolean filter runs.
fn candidate_pool(limit: usize) -> usize {
    (limit * 5).max(50)
}

/// `(name, version, source_url, library_count)` from the first library row.
async fn read_library_info(
    pool: &SqlitePool,
) -> Result<(String, Option<String>, Option<String>, i64)> {
    let rows = sqlx::query("SELECT name, version, source_url FROM library_info")
        .fetch_all(pool)
        .await
        .context("Bundle has no library_info table")?;
    let Some(first) = rows.first() else {
        bail!("Bundle library_info table is empty");
    };
    let version: Option<String> = first.get("version");
    Ok((
        first.get("name"),
        version.filter(|v| !v.trim().is_empty()),
        first.get("source_url"),
        rows.len() as i64,
    ))
}

fn bundle_id(name: &str, version: Option<&str>, libraries: i64, source: &Path) -> String {
    match version {
        Some(v) if libraries == 1 => format!("{}@{}", sanitize(name), sanitize(v)),
        _ => {
            let base = if libraries > 1 {
                source
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or(name)
            } else {
                name
            };
            format!("docs.{}", sanitize(base))
        }
    }
}

fn sanitize(s: &str) -> String {
    let cleaned: String = s
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

/// Ids are what `bundle_id` produces: `[a-z0-9._@-]`, no leading dot.
fn is_valid_bundle_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.' | '@'))
}

/// First `n` sentences containing any term, or the opening sentences when
/// none match.
pub fn highlights(content: &str, terms: &[String], n: usize) -> Vec<String> {
    let sentences = split_sentences(content);
    let matching: Vec<&str> = sentences
        .iter()
        .copied()
        .filter(|s| {
            let lower = s.to_lowercase();
            terms.iter().any(|t| lower.contains(t.as_str()))
        })
        .take(n)
        .collect();
    let picked = if matching.is_empty() {
        sentences.into_iter().take(n).collect()
    } else {
        matching
    };
    picked
        .into_iter()
        .map(|s| s.chars().take(HIGHLIGHT_CHARS).collect())
        .collect()
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    for (i, &(pos, c)) in chars.iter().enumerate() {
        let boundary = c == '\n'
            || (matches!(c, '.' | '!' | '?')
                && chars.get(i + 1).map_or(true, |&(_, next)| next.is_whitespace()));
        if boundary {
            let end = pos + c.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::vec_to_blob;
    use async_trait::async_trait;
    use sqlx::sqlite::SqliteConnectOptions;

    /// Embeds "routing" texts along x and everything else along y.
    struct AxisBackend;

    #[async_trait]
    impl EmbeddingBackend for AxisBackend {
        fn model_name(&self) -> &str {
            "axis"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("routing") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    async fn make_bundle(path: &Path, version: Option<&str>) {
        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new().filename(path).create_if_missing(true),
        )
        .await
        .unwrap();
        sqlx::query("CREATE TABLE library_info (name TEXT, version TEXT, source_url TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE documents (title TEXT, content TEXT, section_type TEXT, url TEXT, embedding BLOB)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO library_info VALUES ('Router', ?, 'https://example.com')")
            .bind(version)
            .execute(&pool)
            .await
            .unwrap();
        let docs = [
            ("Routing basics", "Routes map paths. Nested routing is supported.", [0.9f32, 0.1]),
            ("Legacy routing", "The legacy routing API is deprecated.", [0.8, 0.2]),
            ("Styling", "Use classes for styling.", [0.0, 1.0]),
        ];
        for (title, content, vec) in docs {
            sqlx::query("INSERT INTO documents VALUES (?, ?, 'guide', NULL, ?)")
                .bind(title)
                .bind(content)
                .bind(vec_to_blob(&vec))
                .execute(&pool)
                .await
                .unwrap();
        }
        pool.close().await;
    }

    #[tokio::test]
    async fn test_attach_search_detach() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("router.db");
        make_bundle(&source, Some("6.2")).await;

        let library = DocsLibrary::new(&tmp.path().join("docs"), 1, Arc::new(AxisBackend));
        let info = library.attach_bundle(&source).await.unwrap();
        assert_eq!(info.id, "router@6.2");
        assert_eq!(info.document_count, 3);
        assert_eq!(library.list_bundles().await.unwrap().len(), 1);

        let hits = library.search_docs("routing", &[], 10).await.unwrap();
        assert_eq!(hits[0].title, "Routing basics");
        assert_eq!(hits[0].highlights, vec!["Nested routing is supported.".to_string()]);

        let hits = library.search_docs("routing not legacy", &[], 10).await.unwrap();
        assert!(hits.iter().all(|h| h.title != "Legacy routing"));

        let err = library
            .search_docs("routing", &["missing@1".to_string()], 10)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SearchError>(),
            Some(SearchError::UnknownBundle(_))
        ));

        assert!(library.detach_bundle("router@6.2").await.unwrap());
        assert!(library.list_bundles().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unversioned_bundle_id() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("all.db");
        make_bundle(&source, None).await;
        let library = DocsLibrary::new(&tmp.path().join("docs"), 2, Arc::new(AxisBackend));
        assert_eq!(library.attach_bundle(&source).await.unwrap().id, "docs.router");
    }

    #[tokio::test]
    async fn test_bundle_ids_cannot_escape_the_bundle_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let outside = tmp.path().join("code.sqlite");
        std::fs::write(&outside, b"not a bundle").unwrap();
        let library = DocsLibrary::new(&tmp.path().join("docs"), 1, Arc::new(AxisBackend));

        for id in ["../code", "..", "/etc/passwd", "a\\b", ""] {
            let err = library.detach_bundle(id).await.unwrap_err();
            assert!(matches!(
                err.downcast_ref::<SearchError>(),
                Some(SearchError::InvalidBundleId(_))
            ));
        }
        assert!(outside.exists());

        let err = library
            .search_docs("routing", &["../code".to_string()], 5)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SearchError>(),
            Some(SearchError::InvalidBundleId(_))
        ));
        assert!(!library.detach_bundle("router@6.2").await.unwrap());
    }

    #[test]
    fn test_sanitize_strips_leading_dots() {
        assert_eq!(sanitize("..Router"), "router");
        assert!(is_valid_bundle_id(&bundle_id("../x", Some("1.0"), 1, Path::new("b.db"))));
    }

    #[test]
    fn test_highlights() {
        let text = "Intro line. Tokio runs tasks! Nothing here? Tokio again.";
        assert_eq!(
            highlights(text, &["tokio".into()], 2),
            vec!["Tokio runs tasks!".to_string(), "Tokio again.".to_string()]
        );
        assert_eq!(highlights(text, &["absent".into()], 1), vec!["Intro line.".to_string()]);
    }
}

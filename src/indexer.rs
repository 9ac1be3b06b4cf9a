//! Per-file indexing: filter → read → parse → normalize → persist.
//!
//! A file either lands completely (components, edges and fingerprint in one
//! transaction) or leaves the previous state untouched. Failures are
//! returned as [`FileError`] values; a directory run collects them and keeps
//! going.

use anyhow::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

use crate::config::IndexingConfig;
use crate::embedding::pipeline::{EmbeddingEvents, EmbeddingJob};
use crate::embedding::text::component_text;
use crate::error::{FileError, FileErrorKind};
use crate::models::{now_ts, EntityKind, FileRecord};
use crate::normalize::normalize;
use crate::parser::ParserRegistry;
use crate::progress::{IndexProgressEvent, IndexProgressReporter};
use crate::repository::FileRepository;
use crate::walker::{FileWalker, Skip};

/// Outcome of indexing a directory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexSummary {
    /// Files attempted, including the ones that failed.
    pub files_processed: usize,
    pub components_written: usize,
    pub relationships_written: usize,
    pub errors: Vec<FileError>,
    pub success: bool,
}

impl IndexSummary {
    fn absorb(&mut self, outcome: Result<FileOutcome, FileError>) {
        self.files_processed += 1;
        match outcome {
            Ok(o) => {
                self.components_written += o.components_written;
                self.relationships_written += o.relationships_written;
            }
            Err(e) => self.errors.push(e),
        }
    }
}

/// What one successful file write produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileOutcome {
    pub path: String,
    pub components_written: usize,
    pub relationships_written: usize,
    pub removed_component_ids: Vec<String>,
}

/// Content fingerprint of a file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub content_hash: String,
    pub size: i64,
    pub modified_at: i64,
}

pub fn fingerprint(path: &Path) -> std::io::Result<Fingerprint> {
    let bytes = std::fs::read(path)?;
    let meta = std::fs::metadata(path)?;
    Ok(Fingerprint {
        content_hash: hash_bytes(&bytes),
        size: bytes.len() as i64,
        modified_at: modified_secs(&meta),
    })
}

fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn modified_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub struct FileIndexer {
    files: FileRepository,
    parsers: ParserRegistry,
    walker: FileWalker,
    events: EmbeddingEvents,
    config: IndexingConfig,
}

impl FileIndexer {
    pub fn new(
        root: &Path,
        config: &IndexingConfig,
        parsers: ParserRegistry,
        files: FileRepository,
        events: EmbeddingEvents,
    ) -> Result<Self> {
        let walker = FileWalker::new(root, config, &parsers.extensions())?;
        Ok(Self {
            files,
            parsers,
            walker,
            events,
            config: config.clone(),
        })
    }

    pub fn root(&self) -> &Path {
        self.walker.root()
    }

    pub fn walker(&self) -> &FileWalker {
        &self.walker
    }

    pub fn files(&self) -> &FileRepository {
        &self.files
    }

    /// Absolute form of `path`, resolving relative paths against the root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root().join(path)
        };
        joined.canonicalize().unwrap_or(joined)
    }

    /// Project-relative key for `path`, falling back to the display form.
    pub fn key_for(&self, path: &Path) -> String {
        let abs = self.resolve(path);
        self.walker
            .relative(&abs)
            .unwrap_or_else(|| path.display().to_string())
    }

    /// Index every candidate file under `dir`. Per-file failures are
    /// collected; only setup problems return `Err`.
    pub async fn index_directory(
        &self,
        dir: &Path,
        progress: &dyn IndexProgressReporter,
    ) -> Result<IndexSummary> {
        let start = self.resolve(dir);
        progress.report(IndexProgressEvent::Discovering {
            root: start.display().to_string(),
        });
        let candidates = self.walker.walk_from(&start);
        let total = candidates.len() as u64;
        info!(root = %start.display(), files = total, "indexing directory");

        let mut summary = IndexSummary::default();
        for (i, path) in candidates.iter().enumerate() {
            let outcome = self.index_file(path).await;
            if let Err(e) = &outcome {
                warn!(path = %e.path, kind = e.kind.as_str(), "{}", e.message);
                progress.report(IndexProgressEvent::FileFailed {
                    path: e.path.clone(),
                    reason: format!("{}: {}", e.kind.as_str(), e.message),
                });
            }
            summary.absorb(outcome);
            progress.report(IndexProgressEvent::Indexing {
                path: self.key_for(path),
                n: i as u64 + 1,
                total,
            });
        }

        summary.success = summary.errors.is_empty();
        info!(
            files = summary.files_processed,
            components = summary.components_written,
            relationships = summary.relationships_written,
            errors = summary.errors.len(),
            "index run finished"
        );
        Ok(summary)
    }

    /// Index one file, replacing whatever it contributed before.
    pub async fn index_file(&self, path: &Path) -> Result<FileOutcome, FileError> {
        let abs = self.resolve(path);
        let key = self
            .walker
            .relative(&abs)
            .unwrap_or_else(|| path.display().to_string());

        if let Some(skip) = self.walker.check(&abs) {
            let why = match skip {
                Skip::Extension => "extension not indexed",
                Skip::ExcludedGlob => "matched an exclude glob",
                Skip::IgnoreFile => "matched an ignore file",
                Skip::OutsideRoot => "outside the project root",
            };
            return Err(FileError::new(key, FileErrorKind::Ignored, why));
        }

        let meta = std::fs::metadata(&abs)
            .map_err(|e| FileError::new(&key, FileErrorKind::ReadFailed, e.to_string()))?;
        if meta.len() > self.config.max_file_size {
            return Err(FileError::new(
                &key,
                FileErrorKind::TooLarge,
                format!("{} bytes exceeds limit of {}", meta.len(), self.config.max_file_size),
            ));
        }

        let Some(parser) = self.parsers.for_path(&abs) else {
            return Err(FileError::new(
                &key,
                FileErrorKind::NoParser,
                "no parser registered for this extension",
            ));
        };

        let bytes = std::fs::read(&abs)
            .map_err(|e| FileError::new(&key, FileErrorKind::ReadFailed, e.to_string()))?;
        let content = String::from_utf8(bytes)
            .map_err(|_| FileError::new(&key, FileErrorKind::ReadFailed, "not valid UTF-8"))?;

        let parsed = catch_unwind(AssertUnwindSafe(|| parser.parse(&key, &content)));
        let output = match parsed {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(FileError::new(&key, FileErrorKind::ParseFailed, e.to_string())),
            Err(_) => {
                return Err(FileError::new(&key, FileErrorKind::ParseFailed, "parser panicked"))
            }
        };
        if !output.errors.is_empty() {
            return Err(FileError::new(
                &key,
                FileErrorKind::ParseFailed,
                output.errors.join("; "),
            ));
        }
        for w in &output.warnings {
            debug!(path = %key, "{}", w);
        }

        let normalized = normalize(output);
        let record = FileRecord {
            path: key.clone(),
            content_hash: hash_bytes(content.as_bytes()),
            size: meta.len() as i64,
            modified_at: modified_secs(&meta),
            indexed_at: now_ts(),
            component_count: normalized.components.len() as i64,
        };
        let jobs: Vec<EmbeddingJob> = normalized
            .components
            .iter()
            .map(|c| EmbeddingJob::new(EntityKind::Component, &c.id, component_text(c)))
            .collect();

        let written = self
            .files
            .replace_file_graph(record, normalized.components, normalized.relationships)
            .await
            .map_err(|e| FileError::new(&key, FileErrorKind::WriteFailed, format!("{:#}", e)))?;

        for id in &written.removed_component_ids {
            self.events.removed(EntityKind::Component, id);
        }
        for job in jobs {
            self.events.upsert(job);
        }

        debug!(
            path = %key,
            components = written.components_written,
            relationships = written.relationships_written,
            "indexed file"
        );
        Ok(FileOutcome {
            path: key,
            components_written: written.components_written,
            relationships_written: written.relationships_written,
            removed_component_ids: written.removed_component_ids,
        })
    }

    /// Re-index `path`, or remove it from the graph if it no longer exists.
    pub async fn update_file(&self, path: &Path) -> Result<FileOutcome, FileError> {
        let abs = self.resolve(path);
        if !abs.exists() {
            let key = self.key_for(path);
            let removed = self
                .remove_file(&key)
                .await
                .map_err(|e| FileError::new(&key, FileErrorKind::WriteFailed, format!("{:#}", e)))?;
            return Ok(FileOutcome {
                path: key,
                removed_component_ids: removed,
                ..Default::default()
            });
        }
        self.index_file(&abs).await
    }

    /// Drop everything the file at project-relative `key` contributed.
    pub async fn remove_file(&self, key: &str) -> Result<Vec<String>> {
        let removed = self.files.remove_file(key).await?;
        for id in &removed {
            self.events.removed(EntityKind::Component, id);
        }
        debug!(path = key, removed = removed.len(), "removed file");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::progress::NoProgress;
    use crate::repository::ComponentRepository;
    use crate::storage::StorageCoordinator;
    use std::fs;
    use std::sync::Arc;

    async fn setup(tmp: &Path) -> (FileIndexer, ComponentRepository) {
        let storage = Arc::new(
            StorageCoordinator::initialize(&tmp.join(".code-harness"), &DbConfig::default())
                .await
                .unwrap(),
        );
        let indexer = FileIndexer::new(
            tmp,
            &IndexingConfig {
                max_file_size: 200,
                ..Default::default()
            },
            ParserRegistry::with_builtin(),
            FileRepository::new(Arc::clone(&storage)),
            EmbeddingEvents::disabled(),
        )
        .unwrap();
        (indexer, ComponentRepository::new(storage))
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_going() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("a.py"), "class A:\n    pass\n").unwrap();
        fs::write(tmp.path().join("b.py"), "def b():\n    return 1\n").unwrap();
        fs::write(tmp.path().join("big.py"), "x = 1\n".repeat(100)).unwrap();
        let (indexer, components) = setup(tmp.path()).await;

        let summary = indexer
            .index_directory(tmp.path(), &NoProgress)
            .await
            .unwrap();
        assert_eq!(summary.files_processed, 3);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].kind, FileErrorKind::TooLarge);
        assert!(!summary.success);
        assert!(components.get("a.py#A").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reindex_drops_removed_components() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("m.py");
        fs::write(&file, "def one():\n    pass\n\ndef two():\n    pass\n").unwrap();
        let (indexer, components) = setup(tmp.path()).await;

        indexer.index_file(&file).await.unwrap();
        assert!(components.get("m.py#two").await.unwrap().is_some());

        fs::write(&file, "def one():\n    pass\n").unwrap();
        let outcome = indexer.update_file(&file).await.unwrap();
        assert_eq!(outcome.removed_component_ids, vec!["m.py#two".to_string()]);
        assert!(components.get("m.py#two").await.unwrap().is_none());

        fs::remove_file(&file).unwrap();
        indexer.update_file(&file).await.unwrap();
        assert!(components.by_file("m.py").await.unwrap().is_empty());
        assert!(indexer.files().get("m.py").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_extension_is_ignored() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("notes.txt"), "hello").unwrap();
        let (indexer, _) = setup(tmp.path()).await;
        let err = indexer
            .index_file(&tmp.path().join("notes.txt"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FileErrorKind::Ignored);
    }
}

//! Indexing coordinator: the programmatic API callers attach to.
//!
//! Wires storage, repositories, the file indexer, the embedding pipeline,
//! search, documentation bundles and maintenance together for one project,
//! and sequences the multi-step operations (reconcile, clear, backfill).
//!
//! ```text
//!  IndexingCoordinator
//!   ├── FileIndexer ──▶ FileRepository ──▶ code store write queue
//!   │        └── after-write events ──▶ EmbeddingPipeline (background)
//!   ├── Task/Note/Rule repositories ──▶ meta store write queue
//!   ├── SearchEngine (reads only)
//!   ├── DocsLibrary
//!   └── MaintenanceScheduler
//! ```

use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{validate, Config};
use crate::docs::{BundleInfo, DocHit, DocsLibrary};
use crate::embedding::pipeline::{EmbeddingEvents, EmbeddingJob, EmbeddingPipeline, PipelineMetrics};
use crate::embedding::text::{component_text, content_hash, note_text, rule_text, task_text};
use crate::embedding::{create_backend, EmbeddingBackend};
use crate::error::{FileError, FileErrorKind};
use crate::indexer::{fingerprint, FileIndexer, FileOutcome, IndexSummary};
use crate::maintenance::{MaintenanceScheduler, TagDegradationJob};
use crate::migrate::reset_code_store;
use crate::models::EntityKind;
use crate::parser::ParserRegistry;
use crate::patterns::{analyze, PatternReport};
use crate::progress::{IndexProgressEvent, IndexProgressReporter};
use crate::registry::CoordinatorRegistry;
use crate::repository::{
    queued, ComponentRepository, EmbeddingRepository, FileRepository, NoteRepository,
    RelationshipRepository, RuleRepository, TaskRepository,
};
use crate::search::rerank::create_reranker;
use crate::search::{
    ComponentSource, NoteSource, RuleSource, SearchEngine, SearchRequest, SearchResponse,
    SearchSource, TaskSource,
};
use crate::stats::{collect_stats, IndexStats};
use crate::storage::StorageCoordinator;

/// How long `close` waits for the embedding listener to drain.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of diffing indexed files against the filesystem.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: usize,
    pub errors: Vec<FileError>,
}

impl ReconcileReport {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmbedReport {
    pub considered: usize,
    /// Entities whose stored vector already matches their text.
    pub skipped: usize,
    pub processed: usize,
    pub failed: usize,
}

/// Options for [`IndexingCoordinator`] beyond the config file.
pub struct CoordinatorBuilder {
    root: PathBuf,
    config: Config,
    parsers: ParserRegistry,
    backend: Option<Arc<dyn EmbeddingBackend>>,
    close_timeout: Duration,
}

impl CoordinatorBuilder {
    pub fn parsers(mut self, parsers: ParserRegistry) -> Self {
        self.parsers = parsers;
        self
    }

    /// Use `backend` instead of the one `embedding.provider` selects.
    pub fn backend(mut self, backend: Arc<dyn EmbeddingBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// How long `close` waits for the embedding listener before aborting it.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub async fn open(self, registry: Arc<CoordinatorRegistry>) -> Result<IndexingCoordinator> {
        IndexingCoordinator::initialize_with(self, registry).await
    }
}

pub struct IndexingCoordinator {
    config: Config,
    registry: Arc<CoordinatorRegistry>,
    storage: Arc<StorageCoordinator>,
    indexer: FileIndexer,
    components: ComponentRepository,
    relationships: RelationshipRepository,
    embeddings: EmbeddingRepository,
    tasks: TaskRepository,
    notes: NoteRepository,
    rules: RuleRepository,
    pipeline: Arc<EmbeddingPipeline>,
    listener: Option<JoinHandle<()>>,
    close_timeout: Duration,
    search: SearchEngine,
    docs: DocsLibrary,
    maintenance: Arc<MaintenanceScheduler>,
}

impl IndexingCoordinator {
    pub fn builder(root: &Path, config: Config) -> CoordinatorBuilder {
        CoordinatorBuilder {
            root: root.to_path_buf(),
            config,
            parsers: ParserRegistry::with_builtin(),
            backend: None,
            close_timeout: CLOSE_DRAIN_TIMEOUT,
        }
    }

    /// Open the project at `root` with the built-in parsers and the
    /// configured embedding backend. Any failure here is fatal.
    pub async fn initialize(
        root: &Path,
        config: Config,
        registry: Arc<CoordinatorRegistry>,
    ) -> Result<Self> {
        Self::builder(root, config).open(registry).await
    }

    async fn initialize_with(builder: CoordinatorBuilder, registry: Arc<CoordinatorRegistry>) -> Result<Self> {
        let CoordinatorBuilder {
            root,
            config,
            parsers,
            backend,
            close_timeout,
        } = builder;
        validate(&config)?;

        let backend = match backend {
            Some(b) => b,
            None => create_backend(&config.embedding)?,
        };
        let storage = registry.open(&config.db.dir, &config.db).await?;

        let embeddings = EmbeddingRepository::new(Arc::clone(&storage));
        let pipeline = Arc::new(EmbeddingPipeline::new(
            Arc::clone(&backend),
            embeddings.clone(),
            config.embedding.batch_size,
        ));
        let (events, listener) = if backend.dims() > 0 {
            let (events, rx) = EmbeddingEvents::channel();
            let interval = Duration::from_millis(config.embedding.flush_interval_ms.max(1));
            let handle = Arc::clone(&pipeline).spawn_background(rx, interval);
            (events, Some(handle))
        } else {
            (EmbeddingEvents::disabled(), None)
        };

        let components = ComponentRepository::new(Arc::clone(&storage));
        let tasks = TaskRepository::new(Arc::clone(&storage), events.clone());
        let notes = NoteRepository::new(Arc::clone(&storage), events.clone());
        let rules = RuleRepository::new(Arc::clone(&storage), events.clone());
        let indexer = FileIndexer::new(
            &root,
            &config.indexing,
            parsers,
            FileRepository::new(Arc::clone(&storage)),
            events,
        )?;

        let sources: Vec<Arc<dyn SearchSource>> = vec![
            Arc::new(ComponentSource(components.clone())),
            Arc::new(TaskSource(tasks.clone())),
            Arc::new(NoteSource(notes.clone())),
            Arc::new(RuleSource(rules.clone())),
        ];
        let search = SearchEngine::new(
            sources,
            embeddings.clone(),
            Arc::clone(&backend),
            create_reranker(&config.retrieval)?,
            config.retrieval.clone(),
        );
        let docs = DocsLibrary::new(
            &config.bundle_dir(),
            config.docs.highlight_sentences,
            Arc::clone(&backend),
        );

        let maintenance = MaintenanceScheduler::new(
            Arc::new(TagDegradationJob::new(Arc::clone(&storage), &config.maintenance)),
            config.maintenance.clone(),
        );
        if config.maintenance.enabled {
            maintenance.start();
        }

        info!(
            root = %indexer.root().display(),
            store = %storage.dir().display(),
            embeddings = backend.model_name(),
            "project opened"
        );
        Ok(Self {
            config,
            registry,
            relationships: RelationshipRepository::new(Arc::clone(&storage)),
            storage,
            indexer,
            components,
            embeddings,
            tasks,
            notes,
            rules,
            pipeline,
            listener,
            close_timeout,
            search,
            docs,
            maintenance,
        })
    }

    // ============ Accessors ============

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn root(&self) -> &Path {
        self.indexer.root()
    }

    pub fn storage(&self) -> &Arc<StorageCoordinator> {
        &self.storage
    }

    pub fn components(&self) -> &ComponentRepository {
        &self.components
    }

    pub fn relationships(&self) -> &RelationshipRepository {
        &self.relationships
    }

    pub fn embeddings(&self) -> &EmbeddingRepository {
        &self.embeddings
    }

    pub fn tasks(&self) -> &TaskRepository {
        &self.tasks
    }

    pub fn notes(&self) -> &NoteRepository {
        &self.notes
    }

    pub fn rules(&self) -> &RuleRepository {
        &self.rules
    }

    pub fn pipeline(&self) -> &Arc<EmbeddingPipeline> {
        &self.pipeline
    }

    pub fn docs(&self) -> &DocsLibrary {
        &self.docs
    }

    pub fn maintenance(&self) -> &Arc<MaintenanceScheduler> {
        &self.maintenance
    }

    // ============ Indexing ============

    pub async fn index_directory(
        &self,
        dir: &Path,
        progress: &dyn IndexProgressReporter,
    ) -> Result<IndexSummary> {
        self.indexer.index_directory(dir, progress).await
    }

    pub async fn index_file(&self, path: &Path) -> Result<FileOutcome, FileError> {
        self.indexer.index_file(path).await
    }

    pub async fn update_file(&self, path: &Path) -> Result<FileOutcome, FileError> {
        self.indexer.update_file(path).await
    }

    /// Remove a file from the graph. `path` may be absolute or project-relative.
    pub async fn remove_file(&self, path: &Path) -> Result<Vec<String>> {
        let key = self.indexer.key_for(path);
        self.indexer.remove_file(&key).await
    }

    /// Bring the index under `dir` in line with the filesystem: index new
    /// files, re-index files whose content hash changed, and remove entries
    /// for files that are gone or now excluded.
    pub async fn reconcile_filesystem_changes(
        &self,
        dir: &Path,
        progress: &dyn IndexProgressReporter,
    ) -> Result<ReconcileReport> {
        let start = self.indexer.resolve(dir);
        let Some(scope) = self.indexer.walker().relative(&start) else {
            bail!("{} is outside the project root", dir.display());
        };
        let in_scope = |key: &str| scope.is_empty() || key == scope || key.starts_with(&format!("{}/", scope));

        progress.report(IndexProgressEvent::Discovering {
            root: start.display().to_string(),
        });
        let indexed: HashMap<String, String> = self
            .indexer
            .files()
            .all()
            .await?
            .into_iter()
            .filter(|f| in_scope(&f.path))
            .map(|f| (f.path, f.content_hash))
            .collect();
        let on_disk = self.indexer.walker().walk_from(&start);
        let total = on_disk.len() as u64;

        let mut report = ReconcileReport::default();
        let mut seen = HashSet::new();
        for (i, path) in on_disk.iter().enumerate() {
            let key = self.indexer.key_for(path);
            seen.insert(key.clone());
            progress.report(IndexProgressEvent::Indexing {
                path: key.clone(),
                n: i as u64 + 1,
                total,
            });

            let previous = indexed.get(&key);
            if let Some(hash) = previous {
                match fingerprint(path) {
                    Ok(fp) if &fp.content_hash == hash => {
                        report.unchanged += 1;
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        report
                            .errors
                            .push(FileError::new(&key, FileErrorKind::ReadFailed, e.to_string()));
                        continue;
                    }
                }
            }

            match self.indexer.index_file(path).await {
                Ok(_) if previous.is_some() => report.updated.push(key),
                Ok(_) => report.added.push(key),
                Err(e) => {
                    warn!(path = %e.path, kind = e.kind.as_str(), "{}", e.message);
                    progress.report(IndexProgressEvent::FileFailed {
                        path: e.path.clone(),
                        reason: e.message.clone(),
                    });
                    report.errors.push(e);
                }
            }
        }

        let mut gone: Vec<&String> = indexed.keys().filter(|k| !seen.contains(*k)).collect();
        gone.sort();
        for key in gone {
            match self.indexer.remove_file(key).await {
                Ok(_) => report.removed.push(key.clone()),
                Err(e) => report
                    .errors
                    .push(FileError::new(key, FileErrorKind::WriteFailed, format!("{:#}", e))),
            }
        }

        info!(
            added = report.added.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            unchanged = report.unchanged,
            errors = report.errors.len(),
            "reconcile finished"
        );
        Ok(report)
    }

    /// Drop every component, relationship, file fingerprint and component
    /// embedding, then recreate the code-store schema. Metadata is untouched.
    pub async fn clear_index(&self) -> Result<()> {
        self.pipeline.discard_kind(EntityKind::Component);
        queued(
            self.storage
                .code()
                .run_write(|pool| async move { reset_code_store(&pool).await })
                .await,
        )?;
        info!("code index cleared");
        Ok(())
    }

    // ============ Embeddings ============

    /// Queue every entity whose stored vector is missing or stale (or
    /// every entity when `force` is set), then flush.
    pub async fn generate_all_embeddings(&self, force: bool) -> Result<EmbedReport> {
        if self.pipeline.backend().dims() == 0 {
            bail!("Embedding provider is disabled. Set [embedding] provider in config.");
        }

        let mut candidates: Vec<EmbeddingJob> = Vec::new();
        for c in self.components.all().await? {
            candidates.push(EmbeddingJob::new(EntityKind::Component, &c.id, component_text(&c)));
        }
        for t in self.tasks.list().await? {
            candidates.push(EmbeddingJob::new(EntityKind::Task, &t.id, task_text(&t)));
        }
        for n in self.notes.list().await? {
            candidates.push(EmbeddingJob::new(EntityKind::Note, &n.id, note_text(&n)));
        }
        for r in self.rules.list().await? {
            candidates.push(EmbeddingJob::new(EntityKind::Rule, &r.id, rule_text(&r)));
        }

        let mut report = EmbedReport {
            considered: candidates.len(),
            ..Default::default()
        };
        let mut hashes: HashMap<EntityKind, HashMap<String, String>> = HashMap::new();
        if !force {
            for kind in EntityKind::ALL {
                hashes.insert(kind, self.embeddings.content_hashes(kind).await?);
            }
        }

        let jobs: Vec<EmbeddingJob> = candidates
            .into_iter()
            .filter(|job| {
                let fresh = hashes
                    .get(&job.kind)
                    .and_then(|m| m.get(&job.id))
                    .is_some_and(|h| *h == content_hash(&job.text));
                if fresh {
                    report.skipped += 1;
                }
                !fresh
            })
            .collect();

        self.pipeline.enqueue(jobs);
        let PipelineMetrics {
            processed, failed, ..
        } = self.pipeline.flush().await;
        report.processed = processed;
        report.failed = failed;
        info!(
            considered = report.considered,
            skipped = report.skipped,
            processed = report.processed,
            failed = report.failed,
            "embedding backfill finished"
        );
        Ok(report)
    }

    // ============ Queries ============

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.search.search(request).await
    }

    pub async fn attach_bundle(&self, source: &Path) -> Result<BundleInfo> {
        self.docs.attach_bundle(source).await
    }

    pub async fn list_bundles(&self) -> Result<Vec<BundleInfo>> {
        self.docs.list_bundles().await
    }

    pub async fn detach_bundle(&self, id: &str) -> Result<bool> {
        self.docs.detach_bundle(id).await
    }

    pub async fn search_docs(&self, query: &str, bundle_ids: &[String], limit: usize) -> Result<Vec<DocHit>> {
        self.docs.search_docs(query, bundle_ids, limit).await
    }

    pub async fn get_stats(&self) -> Result<IndexStats> {
        collect_stats(&self.storage).await
    }

    /// Run the pattern analyzer over the current graph snapshot.
    pub async fn analyze_patterns(&self) -> Result<PatternReport> {
        let components = self.components.all().await?;
        let relationships = self.relationships.all().await?;
        Ok(analyze(&components, &relationships))
    }

    /// Stop maintenance, drain pending embeddings, and close both stores.
    pub async fn close(self) -> Result<()> {
        self.maintenance.stop();
        let Self {
            listener,
            close_timeout,
            registry,
            storage,
            pipeline,
            indexer,
            search,
            tasks,
            notes,
            rules,
            ..
        } = self;

        // The listener finishes once every event sender is gone.
        drop((indexer, search, tasks, notes, rules));
        if let Some(mut handle) = listener {
            match tokio::time::timeout(close_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "embedding listener ended abnormally"),
                Err(_) => {
                    warn!("embedding listener did not stop in time; aborting it and flushing directly");
                    handle.abort();
                    if let Err(e) = handle.await {
                        if !e.is_cancelled() {
                            warn!(error = %e, "embedding listener ended abnormally");
                        }
                    }
                    pipeline.flush().await;
                }
            }
        }

        let dir = storage.dir().to_path_buf();
        drop(storage);
        if !registry.close(&dir).await? {
            warn!(dir = %dir.display(), "store was not registered");
        }
        info!("project closed");
        Ok(())
    }
}

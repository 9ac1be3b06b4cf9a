//! Background embedding pipeline.
//!
//! Repositories publish [`EmbeddingEvent`]s after a write commits; the
//! pipeline collects them into a pending list and drains it in fixed-size
//! batches, one backend call per batch, persisting each vector on its own.
//!
//! ```text
//!  repository write ──event──▶ channel ──▶ listener ──▶ pending ──flush──▶ backend ──▶ embeddings
//!                                            ▲ timer ─────────┘
//! ```
//!
//! A failed batch counts its entities as failed and the flush moves on to
//! the next batch. Vectors for entities deleted while their batch was in
//! flight are dropped rather than written. Entities enqueued while a batch is in flight are picked
//! up by the next batch of the same flush.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::text::content_hash;
use super::EmbeddingBackend;
use crate::models::{now_ts, EmbeddingRecord, EntityKind};
use crate::repository::EmbeddingRepository;

/// One entity's text, ready to embed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingJob {
    pub kind: EntityKind,
    pub id: String,
    pub text: String,
}

impl EmbeddingJob {
    pub fn new(kind: EntityKind, id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            text: text.into(),
        }
    }
}

/// Published by repositories after a write has committed.
#[derive(Debug, Clone)]
pub enum EmbeddingEvent {
    Upsert(EmbeddingJob),
    Removed { kind: EntityKind, id: String },
}

/// Sending half of the after-write channel. Publishing never blocks and
/// never fails the write; with no pipeline attached events are dropped.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingEvents {
    tx: Option<mpsc::UnboundedSender<EmbeddingEvent>>,
}

impl EmbeddingEvents {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EmbeddingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn publish(&self, event: EmbeddingEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                debug!("embedding pipeline is gone; dropping event");
            }
        }
    }

    pub fn upsert(&self, job: EmbeddingJob) {
        self.publish(EmbeddingEvent::Upsert(job));
    }

    pub fn removed(&self, kind: EntityKind, id: &str) {
        self.publish(EmbeddingEvent::Removed {
            kind,
            id: id.to_string(),
        });
    }
}

/// Outcome counters. After a flush returns, `pending` is zero unless new
/// work arrived after the flush observed an empty list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineMetrics {
    pub processed: usize,
    pub failed: usize,
    /// Embedded, but the entity was gone by the time the vector was written.
    pub dropped: usize,
    pub pending: usize,
}

type JobKey = (EntityKind, String);

/// Pending jobs in arrival order, keyed by entity.
///
/// `order` may hold entries that were discarded or re-enqueued since; an
/// entry is live only while its sequence number matches the one in `jobs`.
/// Stale entries are skipped when popped and compacted away once they
/// outnumber live jobs.
#[derive(Default)]
struct PendingQueue {
    order: VecDeque<(u64, JobKey)>,
    jobs: HashMap<JobKey, (u64, String)>,
    next_seq: u64,
}

impl PendingQueue {
    fn push(&mut self, job: EmbeddingJob) {
        let key = (job.kind, job.id);
        if let Some((_, text)) = self.jobs.get_mut(&key) {
            *text = job.text;
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.push_back((seq, key.clone()));
        self.jobs.insert(key, (seq, job.text));
    }

    fn remove(&mut self, kind: EntityKind, id: &str) {
        if self.jobs.remove(&(kind, id.to_string())).is_some() {
            self.compact();
        }
    }

    fn remove_kind(&mut self, kind: EntityKind) {
        self.jobs.retain(|(k, _), _| *k != kind);
        self.order.retain(|(_, (k, _))| *k != kind);
    }

    fn pop(&mut self) -> Option<EmbeddingJob> {
        while let Some((seq, key)) = self.order.pop_front() {
            if self.jobs.get(&key).is_some_and(|(live, _)| *live == seq) {
                if let Some((_, text)) = self.jobs.remove(&key) {
                    let (kind, id) = key;
                    return Some(EmbeddingJob { kind, id, text });
                }
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.jobs.len()
    }

    fn compact(&mut self) {
        if self.order.len() > 2 * self.jobs.len() + 64 {
            let jobs = &self.jobs;
            self.order
                .retain(|(seq, key)| jobs.get(key).is_some_and(|(live, _)| live == seq));
        }
    }
}

pub struct EmbeddingPipeline {
    backend: Arc<dyn EmbeddingBackend>,
    embeddings: EmbeddingRepository,
    batch_size: usize,
    pending: Mutex<PendingQueue>,
    /// Held for the whole of a flush so batches never run concurrently.
    flushing: tokio::sync::Mutex<()>,
    totals: Mutex<PipelineMetrics>,
}

impl EmbeddingPipeline {
    pub fn new(
        backend: Arc<dyn EmbeddingBackend>,
        embeddings: EmbeddingRepository,
        batch_size: usize,
    ) -> Self {
        Self {
            backend,
            embeddings,
            batch_size: batch_size.max(1),
            pending: Mutex::new(PendingQueue::default()),
            flushing: tokio::sync::Mutex::new(()),
            totals: Mutex::new(PipelineMetrics::default()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn EmbeddingBackend> {
        &self.backend
    }

    /// Append jobs to the pending list. A job for an entity that is already
    /// pending replaces the older text in place.
    pub fn enqueue(&self, jobs: impl IntoIterator<Item = EmbeddingJob>) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for job in jobs {
            pending.push(job);
        }
    }

    /// Drop any pending job for a removed entity.
    pub fn discard(&self, kind: EntityKind, id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(kind, id);
    }

    /// Drop every pending job of `kind`.
    pub fn discard_kind(&self, kind: EntityKind) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove_kind(kind);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Cumulative counters across every flush so far.
    pub fn totals(&self) -> PipelineMetrics {
        let mut totals = *self.totals.lock().unwrap_or_else(|e| e.into_inner());
        totals.pending = self.pending_len();
        totals
    }

    fn next_batch(&self) -> Vec<EmbeddingJob> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        std::iter::from_fn(|| pending.pop())
            .take(self.batch_size)
            .collect()
    }

    /// Drain the pending list in batches and return this flush's counters.
    pub async fn flush(&self) -> PipelineMetrics {
        let _guard = self.flushing.lock().await;
        let mut metrics = PipelineMetrics::default();

        loop {
            let batch = self.next_batch();
            if batch.is_empty() {
                break;
            }
            let outcome = self.run_batch(batch).await;
            metrics.processed += outcome.processed;
            metrics.failed += outcome.failed;
            metrics.dropped += outcome.dropped;
        }

        metrics.pending = self.pending_len();
        {
            let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
            totals.processed += metrics.processed;
            totals.failed += metrics.failed;
            totals.dropped += metrics.dropped;
        }
        if metrics.processed + metrics.failed > 0 {
            info!(
                processed = metrics.processed,
                failed = metrics.failed,
                dropped = metrics.dropped,
                "embedding flush complete"
            );
        }
        metrics
    }

    /// One backend call. `pending` is left at zero in the result.
    async fn run_batch(&self, batch: Vec<EmbeddingJob>) -> PipelineMetrics {
        let mut outcome = PipelineMetrics::default();
        let texts: Vec<String> = batch.iter().map(|j| j.text.clone()).collect();
        let vectors = match self.backend.embed(&texts).await {
            Ok(v) if v.len() == batch.len() => v,
            Ok(v) => {
                warn!(
                    expected = batch.len(),
                    got = v.len(),
                    "embedding backend returned wrong number of vectors"
                );
                outcome.failed = batch.len();
                return outcome;
            }
            Err(e) => {
                warn!(size = batch.len(), error = %e, "embedding batch failed");
                outcome.failed = batch.len();
                return outcome;
            }
        };

        for (job, vector) in batch.into_iter().zip(vectors) {
            let record = EmbeddingRecord {
                content_hash: content_hash(&job.text),
                entity_id: job.id,
                entity_kind: job.kind,
                version: 0,
                model: self.backend.model_name().to_string(),
                dims: vector.len(),
                vector,
                created_at: now_ts(),
            };
            let (kind, id) = (record.entity_kind, record.entity_id.clone());
            match self.embeddings.upsert(record).await {
                Ok(Some(_)) => outcome.processed += 1,
                Ok(None) => {
                    debug!(kind = kind.as_str(), id = %id, "entity removed before its vector was written");
                    outcome.dropped += 1;
                }
                Err(e) => {
                    warn!(error = %e, "failed to persist embedding");
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    /// Consume after-write events and flush when a full batch is pending or
    /// when `interval` elapses with work pending. Ends with a final flush
    /// once every event sender is dropped.
    pub fn spawn_background(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<EmbeddingEvent>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(EmbeddingEvent::Upsert(job)) => {
                            self.enqueue([job]);
                            if self.pending_len() >= self.batch_size {
                                self.flush().await;
                            }
                        }
                        Some(EmbeddingEvent::Removed { kind, id }) => self.discard(kind, &id),
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if self.pending_len() > 0 {
                            self.flush().await;
                        }
                    }
                }
            }
            self.flush().await;
            debug!("embedding pipeline stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::storage::StorageCoordinator;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns `[len, 1.0]` per text; fails on the call numbers listed in `fail_on`.
    struct ScriptedBackend {
        calls: AtomicUsize,
        sizes: Mutex<Vec<usize>>,
        fail_on: Vec<usize>,
    }

    impl ScriptedBackend {
        fn new(fail_on: Vec<usize>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                sizes: Mutex::new(Vec::new()),
                fail_on,
            }
        }
    }

    #[async_trait]
    impl EmbeddingBackend for ScriptedBackend {
        fn model_name(&self) -> &str {
            "scripted"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.sizes.lock().unwrap().push(texts.len());
            if self.fail_on.contains(&call) {
                anyhow::bail!("backend unavailable");
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    /// Stores seeded with notes `note_0..note_9` and tasks `task_1`, `task_2`.
    async fn repo() -> (tempfile::TempDir, Arc<StorageCoordinator>, EmbeddingRepository) {
        let tmp = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(
            StorageCoordinator::initialize(tmp.path(), &DbConfig::default())
                .await
                .unwrap(),
        );
        let pool = storage.meta().pool();
        for i in 0..10 {
            sqlx::query("INSERT INTO notes (id, title, created_at, updated_at) VALUES (?, 'n', 0, 0)")
                .bind(format!("note_{}", i))
                .execute(pool)
                .await
                .unwrap();
        }
        for id in ["task_1", "task_2"] {
            sqlx::query("INSERT INTO tasks (id, title, created_at, updated_at) VALUES (?, 't', 0, 0)")
                .bind(id)
                .execute(pool)
                .await
                .unwrap();
        }
        let embeddings = EmbeddingRepository::new(Arc::clone(&storage));
        (tmp, storage, embeddings)
    }

    fn jobs(n: usize) -> Vec<EmbeddingJob> {
        (0..n)
            .map(|i| EmbeddingJob::new(EntityKind::Note, format!("note_{}", i), format!("text {}", i)))
            .collect()
    }

    #[tokio::test]
    async fn test_batches_and_isolates_failed_batch() {
        let (_tmp, _storage, embeddings) = repo().await;
        let backend = Arc::new(ScriptedBackend::new(vec![2]));
        let pipeline = EmbeddingPipeline::new(backend.clone(), embeddings.clone(), 2);

        pipeline.enqueue(jobs(5));
        let metrics = pipeline.flush().await;

        assert_eq!(*backend.sizes.lock().unwrap(), vec![2, 2, 1]);
        assert_eq!(
            metrics,
            PipelineMetrics {
                processed: 3,
                failed: 2,
                dropped: 0,
                pending: 0
            }
        );
        assert_eq!(embeddings.count(EntityKind::Note).await.unwrap(), 3);
        assert!(embeddings.get(EntityKind::Note, "note_2").await.unwrap().is_none());
        assert_eq!(pipeline.totals().failed, 2);
    }

    #[tokio::test]
    async fn test_enqueue_replaces_pending_duplicate() {
        let (_tmp, _storage, embeddings) = repo().await;
        let pipeline = EmbeddingPipeline::new(Arc::new(ScriptedBackend::new(vec![])), embeddings.clone(), 8);

        pipeline.enqueue([EmbeddingJob::new(EntityKind::Task, "task_1", "old")]);
        pipeline.enqueue([EmbeddingJob::new(EntityKind::Task, "task_1", "newer text")]);
        pipeline.enqueue([EmbeddingJob::new(EntityKind::Task, "task_2", "x")]);
        pipeline.discard(EntityKind::Task, "task_2");
        assert_eq!(pipeline.pending_len(), 1);

        pipeline.flush().await;
        let stored = embeddings.get(EntityKind::Task, "task_1").await.unwrap().unwrap();
        assert_eq!(stored.vector[0], "newer text".len() as f32);
        assert_eq!(stored.content_hash, content_hash("newer text"));
    }

    #[tokio::test]
    async fn test_background_listener_flushes_on_close() {
        let (_tmp, _storage, embeddings) = repo().await;
        let pipeline = Arc::new(EmbeddingPipeline::new(
            Arc::new(ScriptedBackend::new(vec![])),
            embeddings.clone(),
            10,
        ));
        let (events, rx) = EmbeddingEvents::channel();
        let handle = Arc::clone(&pipeline).spawn_background(rx, Duration::from_secs(3600));

        for job in jobs(3) {
            events.upsert(job);
        }
        drop(events);
        handle.await.unwrap();

        assert_eq!(embeddings.count(EntityKind::Note).await.unwrap(), 3);
        assert_eq!(pipeline.totals().processed, 3);
    }

    /// Deletes `note_0` from the meta store while the batch is being embedded.
    struct DeletingBackend {
        storage: Arc<StorageCoordinator>,
    }

    #[async_trait]
    impl EmbeddingBackend for DeletingBackend {
        fn model_name(&self) -> &str {
            "deleting"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            sqlx::query("DELETE FROM notes WHERE id = 'note_0'")
                .execute(self.storage.meta().pool())
                .await?;
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    #[tokio::test]
    async fn test_entity_deleted_mid_batch_leaves_no_vector() {
        let (_tmp, storage, embeddings) = repo().await;
        let pipeline = EmbeddingPipeline::new(
            Arc::new(DeletingBackend {
                storage: Arc::clone(&storage),
            }),
            embeddings.clone(),
            8,
        );

        pipeline.enqueue(jobs(2));
        let metrics = pipeline.flush().await;

        assert_eq!(metrics.processed, 1);
        assert_eq!(metrics.dropped, 1);
        assert_eq!(metrics.failed, 0);
        assert!(embeddings.get(EntityKind::Note, "note_0").await.unwrap().is_none());
        assert!(embeddings.get(EntityKind::Note, "note_1").await.unwrap().is_some());
        assert_eq!(pipeline.totals().dropped, 1);
    }

    #[test]
    fn test_pending_queue_keeps_arrival_order_under_churn() {
        let mut queue = PendingQueue::default();
        for i in 0..500 {
            queue.push(EmbeddingJob::new(EntityKind::Note, format!("note_{}", i), "a"));
        }
        for i in (0..500).step_by(2) {
            queue.remove(EntityKind::Note, &format!("note_{}", i));
        }
        // Re-enqueued after a discard: goes to the back.
        queue.push(EmbeddingJob::new(EntityKind::Note, "note_0", "again"));
        // Already pending: text replaced, position kept.
        queue.push(EmbeddingJob::new(EntityKind::Note, "note_1", "newer"));
        queue.push(EmbeddingJob::new(EntityKind::Task, "task_1", "t"));
        queue.remove_kind(EntityKind::Task);
        assert_eq!(queue.len(), 251);
        assert!(queue.order.len() <= 2 * queue.len() + 64);

        let drained: Vec<EmbeddingJob> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(drained.len(), 251);
        assert_eq!(drained[0].id, "note_1");
        assert_eq!(drained[0].text, "newer");
        assert_eq!(drained[1].id, "note_3");
        assert_eq!(drained[250].id, "note_0");
        assert_eq!(drained[250].text, "again");
        assert_eq!(queue.len(), 0);
    }
}

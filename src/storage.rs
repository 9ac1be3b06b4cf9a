//! Storage coordination: two embedded stores per project, one writer each.
//!
//! A [`StorageCoordinator`] owns the code-graph store and the metadata
//! store. Each store is a [`StoreHandle`]: a read pool plus a
//! [`WriteQueue`].
//!
//! ```text
//!   caller A ─┐                      ┌──────────────┐
//!   caller B ─┼─ run_write(fn) ──▶  │ FIFO channel │ ──▶ worker ──▶ SQLite
//!   caller C ─┘                      └──────────────┘   (one unit at a time)
//!
//!   readers ─────────────── pool ─────────────────────────────▶ SQLite (WAL)
//! ```
//!
//! # Guarantees
//!
//! - Units of work run strictly one at a time, in submission order.
//! - A unit that returns `Err` or panics fails only its own submitter; the
//!   worker moves on to the next unit.
//! - Reads never wait on the queue.
//! - [`StorageCoordinator::disconnect`] stops accepting work, drains what
//!   was already queued, then closes both pools.

use anyhow::Result;
use sqlx::SqlitePool;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DbConfig;
use crate::db;
use crate::error::QueueError;
use crate::migrate;
use crate::models::StoreKind;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Job = Box<dyn FnOnce(SqlitePool) -> BoxFuture + Send>;

/// Single-lane write queue for one store.
pub struct WriteQueue {
    name: &'static str,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WriteQueue {
    /// Start the worker task for `pool`. Must be called inside a tokio runtime.
    pub fn start(name: &'static str, pool: SqlitePool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let worker = tokio::spawn(run_worker(name, pool, rx));
        Self {
            name,
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue `f` now and return a ticket for its result.
    ///
    /// The unit's position in the queue is fixed by the time this returns,
    /// so the order of `submit` calls is the order of execution. `f`
    /// receives the store's pool and should do all of its writes (usually
    /// one transaction) before returning.
    pub fn submit<F, Fut, T>(&self, f: F) -> WriteTicket<T>
    where
        F: FnOnce(SqlitePool) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::new(move |pool| {
            Box::pin(async move {
                let result = f(pool).await;
                // The submitter may have stopped waiting; nothing to do then.
                let _ = done_tx.send(result);
            })
        });

        let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let queued = match guard.as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };

        WriteTicket {
            store: self.name,
            receiver: queued.then_some(done_rx),
        }
    }

    /// Enqueue `f` and wait for its result.
    pub async fn run<F, Fut, T>(&self, f: F) -> Result<T, QueueError>
    where
        F: FnOnce(SqlitePool) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(f).wait().await
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    /// Stop accepting work and wait until everything already queued has run.
    pub async fn close(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(sender);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(store = self.name, error = %e, "write queue worker ended abnormally");
            }
        }
    }
}

/// Ordering token for one queued unit of work.
pub struct WriteTicket<T> {
    store: &'static str,
    receiver: Option<oneshot::Receiver<Result<T>>>,
}

impl<T> WriteTicket<T> {
    /// Wait for the unit to run and return its outcome.
    pub async fn wait(self) -> Result<T, QueueError> {
        let receiver = self.receiver.ok_or(QueueError::Closed { store: self.store })?;
        match receiver.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(QueueError::Failed {
                store: self.store,
                source,
            }),
            // The job was dropped without reporting: it panicked.
            Err(_) => Err(QueueError::Panicked { store: self.store }),
        }
    }
}

async fn run_worker(name: &'static str, pool: SqlitePool, mut rx: mpsc::UnboundedReceiver<Job>) {
    debug!(store = name, "write queue started");
    while let Some(job) = rx.recv().await {
        // Each unit runs in its own task so a panic is contained to it.
        if let Err(e) = tokio::spawn(job(pool.clone())).await {
            warn!(store = name, error = %e, "write unit panicked");
        }
    }
    debug!(store = name, "write queue drained");
}

/// One embedded store: read pool + write queue.
pub struct StoreHandle {
    kind: StoreKind,
    path: PathBuf,
    pool: SqlitePool,
    queue: WriteQueue,
}

impl StoreHandle {
    async fn open(kind: StoreKind, path: PathBuf, config: &DbConfig) -> Result<Self> {
        let pool = db::connect(&path, config).await?;
        match kind {
            StoreKind::Code => migrate::migrate_code_store(&pool).await?,
            StoreKind::Meta => migrate::migrate_meta_store(&pool).await?,
        }
        let name = match kind {
            StoreKind::Code => "code",
            StoreKind::Meta => "meta",
        };
        let queue = WriteQueue::start(name, pool.clone());
        Ok(Self {
            kind,
            path,
            pool,
            queue,
        })
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pool for reads. Do not write through this directly.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Serialize a write through this store's queue.
    pub async fn run_write<F, Fut, T>(&self, f: F) -> Result<T, QueueError>
    where
        F: FnOnce(SqlitePool) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.queue.run(f).await
    }

    /// Enqueue a write without waiting; see [`WriteQueue::submit`].
    pub fn submit_write<F, Fut, T>(&self, f: F) -> WriteTicket<T>
    where
        F: FnOnce(SqlitePool) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.queue.submit(f)
    }

    async fn close(&self) {
        self.queue.close().await;
        self.pool.close().await;
    }
}

/// Owns both stores of one project.
pub struct StorageCoordinator {
    dir: PathBuf,
    code: StoreHandle,
    meta: StoreHandle,
}

impl StorageCoordinator {
    /// Open (creating if needed) both stores under `dir` and run migrations.
    ///
    /// Any failure here is fatal to the caller.
    pub async fn initialize(dir: &Path, config: &DbConfig) -> Result<Self> {
        let code = StoreHandle::open(
            StoreKind::Code,
            dir.join(StoreKind::Code.file_name()),
            config,
        )
        .await?;
        let meta = StoreHandle::open(
            StoreKind::Meta,
            dir.join(StoreKind::Meta.file_name()),
            config,
        )
        .await?;

        info!(dir = %dir.display(), "storage initialized");
        Ok(Self {
            dir: dir.to_path_buf(),
            code,
            meta,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn code(&self) -> &StoreHandle {
        &self.code
    }

    pub fn meta(&self) -> &StoreHandle {
        &self.meta
    }

    pub fn store(&self, kind: StoreKind) -> &StoreHandle {
        match kind {
            StoreKind::Code => &self.code,
            StoreKind::Meta => &self.meta,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.code.queue.is_closed() && self.meta.queue.is_closed()
    }

    /// Drain both write queues and close both stores.
    pub async fn disconnect(&self) {
        self.code.close().await;
        self.meta.close().await;
        info!(dir = %self.dir.display(), "storage closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn open_tmp() -> (tempfile::TempDir, StorageCoordinator) {
        let tmp = tempfile::TempDir::new().unwrap();
        let storage = StorageCoordinator::initialize(tmp.path(), &DbConfig::default())
            .await
            .unwrap();
        (tmp, storage)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_apply_in_submission_order() {
        let (_tmp, storage) = open_tmp().await;
        let storage = Arc::new(storage);

        storage
            .meta()
            .run_write(|pool| async move {
                sqlx::query("CREATE TABLE seq (n INTEGER NOT NULL, overlapping INTEGER NOT NULL)")
                    .execute(&pool)
                    .await?;
                Ok(())
            })
            .await
            .unwrap();

        // Each unit records how many other units were running when it
        // started; the queue must never let two overlap.
        let active = Arc::new(AtomicUsize::new(0));
        let tickets: Vec<_> = (0..20i64)
            .map(|n| {
                let active = Arc::clone(&active);
                storage.meta().submit_write(move |pool| async move {
                    let others = active.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    sqlx::query("INSERT INTO seq (n, overlapping) VALUES (?, ?)")
                        .bind(n)
                        .bind(others as i64)
                        .execute(&pool)
                        .await?;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(n)
                })
            })
            .collect();

        // Wait from many tasks at once, in reverse, to show completion order
        // does not depend on who is waiting.
        let handles: Vec<_> = tickets
            .into_iter()
            .rev()
            .map(|t| tokio::spawn(t.wait()))
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let rows: Vec<(i64, i64)> =
            sqlx::query_as("SELECT n, overlapping FROM seq ORDER BY rowid")
                .fetch_all(storage.meta().pool())
                .await
                .unwrap();
        let order: Vec<i64> = rows.iter().map(|(n, _)| *n).collect();
        assert_eq!(order, (0..20).collect::<Vec<_>>());
        assert!(rows.iter().all(|(_, overlapping)| *overlapping == 0));
    }

    #[tokio::test]
    async fn test_failed_unit_does_not_poison_queue() {
        let (_tmp, storage) = open_tmp().await;

        let err = storage
            .code()
            .run_write(|pool| async move {
                sqlx::query("INSERT INTO no_such_table VALUES (1)")
                    .execute(&pool)
                    .await?;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Failed { store: "code", .. }));

        let panicked = storage
            .code()
            .run_write(|_pool| async move {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(panicked, QueueError::Panicked { .. }));

        let value = storage
            .code()
            .run_write(|pool| async move {
                let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM components")
                    .fetch_one(&pool)
                    .await?;
                Ok(n)
            })
            .await
            .unwrap();
        assert_eq!(value, 0);
    }

    #[tokio::test]
    async fn test_disconnect_rejects_new_work() {
        let (_tmp, storage) = open_tmp().await;
        storage.disconnect().await;
        assert!(storage.is_closed());

        let err = storage
            .meta()
            .run_write(|_pool| async move { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Closed { store: "meta" }));
    }
}

//! Periodic maintenance with bounded retries and health reporting.
//!
//! A [`MaintenanceScheduler`] runs one [`MaintenanceJob`] on a fixed
//! interval. Ticks never overlap: a tick that fires while a run is still in
//! progress is rejected. A failed run is not retried immediately; the next
//! scheduled tick is the retry. After `max_retries` consecutive failures the
//! timer stops and health reports `error` until [`MaintenanceScheduler::start`]
//! is called again.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::MaintenanceConfig;
use crate::models::now_ts;
use crate::repository::queued;
use crate::storage::StorageCoordinator;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub updated: u64,
    pub deleted: u64,
}

#[async_trait]
pub trait MaintenanceJob: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self) -> Result<JobReport>;
}

/// Decays the weight of tags unused for `stale_after_days` and deletes
/// unreferenced tags whose weight has dropped below the prune threshold.
pub struct TagDegradationJob {
    storage: Arc<StorageCoordinator>,
    decay_factor: f64,
    stale_after_secs: i64,
    prune_threshold: f64,
}

impl TagDegradationJob {
    pub fn new(storage: Arc<StorageCoordinator>, config: &MaintenanceConfig) -> Self {
        Self {
            storage,
            decay_factor: config.tag_decay_factor,
            stale_after_secs: config.tag_stale_after_days * 86_400,
            prune_threshold: config.tag_prune_threshold,
        }
    }
}

#[async_trait]
impl MaintenanceJob for TagDegradationJob {
    fn name(&self) -> &'static str {
        "tag_degradation"
    }

    async fn run(&self) -> Result<JobReport> {
        let cutoff = now_ts() - self.stale_after_secs;
        let decay = self.decay_factor;
        let threshold = self.prune_threshold;

        queued(
            self.storage
                .meta()
                .run_write(move |pool| async move {
                    let mut tx = pool.begin().await?;
                    let decayed = sqlx::query("UPDATE tags SET weight = weight * ? WHERE last_used_at < ?")
                        .bind(decay)
                        .bind(cutoff)
                        .execute(&mut *tx)
                        .await?
                        .rows_affected();
                    let pruned = sqlx::query(
                        r#"
                        DELETE FROM tags
                        WHERE weight < ?
                          AND NOT EXISTS (SELECT 1 FROM tasks, json_each(tasks.tags_json) j WHERE j.value = tags.name)
                          AND NOT EXISTS (SELECT 1 FROM notes, json_each(notes.tags_json) j WHERE j.value = tags.name)
                          AND NOT EXISTS (SELECT 1 FROM rules, json_each(rules.tags_json) j WHERE j.value = tags.name)
                        "#,
                    )
                    .bind(threshold)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                    tx.commit().await?;
                    Ok(JobReport {
                        updated: decayed,
                        deleted: pruned,
                    })
                })
                .await,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: Health,
    pub runs: u64,
    pub failures: u64,
    /// Consecutive failures, never above the configured maximum.
    pub retry_count: u32,
    pub last_run_at: Option<i64>,
    pub last_success_at: Option<i64>,
    pub last_error: Option<String>,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed(JobReport),
    Failed(String),
    /// A run was already in progress.
    Rejected,
}

#[derive(Debug, Default)]
struct RunStats {
    runs: u64,
    failures: u64,
    retry_count: u32,
    armed_at: Option<i64>,
    last_run_at: Option<i64>,
    last_success_at: Option<i64>,
    last_error: Option<String>,
}

pub struct MaintenanceScheduler {
    job: Arc<dyn MaintenanceJob>,
    config: MaintenanceConfig,
    running: AtomicBool,
    stats: Mutex<RunStats>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl MaintenanceScheduler {
    pub fn new(job: Arc<dyn MaintenanceJob>, config: MaintenanceConfig) -> Arc<Self> {
        Arc::new(Self {
            job,
            config,
            running: AtomicBool::new(false),
            stats: Mutex::new(RunStats::default()),
            timer: Mutex::new(None),
        })
    }

    /// Arm the periodic timer. Restarting resets the retry counter.
    /// Returns false if the timer was already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let Ok(mut timer) = self.timer.lock() else {
            return false;
        };
        if timer.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }
        if let Ok(mut stats) = self.stats.lock() {
            stats.retry_count = 0;
            stats.armed_at = Some(now_ts());
        }

        let period = Duration::from_secs(self.config.interval_secs.max(1));
        let this = Arc::clone(self);
        *timer = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let outcome = this.tick().await;
                if matches!(outcome, TickOutcome::Failed(_)) && this.retries_exhausted() {
                    error!(job = this.job.name(), "maintenance retries exhausted, stopping timer");
                    break;
                }
            }
        }));
        info!(job = self.job.name(), interval_secs = period.as_secs(), "maintenance scheduler started");
        true
    }

    pub fn stop(&self) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
    }

    pub fn is_armed(&self) -> bool {
        self.timer
            .lock()
            .map(|t| t.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    fn retries_exhausted(&self) -> bool {
        self.stats
            .lock()
            .map(|s| s.retry_count >= self.config.max_retries)
            .unwrap_or(true)
    }

    /// Run the job once, unless a run is already in progress.
    pub async fn tick(&self) -> TickOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(job = self.job.name(), "tick rejected, run in progress");
            return TickOutcome::Rejected;
        }
        let _running = RunningGuard(&self.running);

        // A panicking job surfaces as a failed run instead of wedging the flag.
        let job = Arc::clone(&self.job);
        let result = match tokio::spawn(async move { job.run().await }).await {
            Ok(result) => result,
            Err(e) => Err(anyhow!("maintenance job panicked: {}", e)),
        };
        let now = now_ts();
        let outcome = match result {
            Ok(report) => {
                debug!(job = self.job.name(), updated = report.updated, deleted = report.deleted, "maintenance run finished");
                TickOutcome::Completed(report)
            }
            Err(e) => {
                error!(job = self.job.name(), error = %e, "maintenance run failed");
                TickOutcome::Failed(format!("{:#}", e))
            }
        };

        if let Ok(mut stats) = self.stats.lock() {
            stats.runs += 1;
            stats.last_run_at = Some(now);
            match &outcome {
                TickOutcome::Completed(_) => {
                    stats.retry_count = 0;
                    stats.last_success_at = Some(now);
                    stats.last_error = None;
                }
                TickOutcome::Failed(msg) => {
                    stats.failures += 1;
                    stats.retry_count = (stats.retry_count + 1).min(self.config.max_retries);
                    stats.last_error = Some(msg.clone());
                }
                TickOutcome::Rejected => {}
            }
        }
        outcome
    }

    pub fn health(&self) -> HealthReport {
        self.health_at(now_ts())
    }

    fn health_at(&self, now: i64) -> HealthReport {
        let armed = self.is_armed();
        let Ok(stats) = self.stats.lock() else {
            return HealthReport {
                status: Health::Error,
                runs: 0,
                failures: 0,
                retry_count: 0,
                last_run_at: None,
                last_success_at: None,
                last_error: Some("scheduler state poisoned".to_string()),
                reasons: vec!["scheduler state poisoned".to_string()],
            };
        };

        let mut status = Health::Healthy;
        let mut reasons = Vec::new();

        if self.config.enabled && !armed {
            status = Health::Error;
            if stats.retry_count >= self.config.max_retries && stats.failures > 0 {
                reasons.push(format!("stopped after {} consecutive failures", stats.retry_count));
            } else {
                reasons.push("enabled but not running".to_string());
            }
        } else {
            if stats.runs > 0 {
                let rate = stats.failures as f64 / stats.runs as f64;
                if rate > self.config.warning_failure_rate {
                    status = Health::Warning;
                    reasons.push(format!("failure rate {:.0}%", rate * 100.0));
                }
            }
            let overdue_after = (self.config.interval_secs as f64 * self.config.overdue_factor) as i64;
            if let Some(since) = stats.last_success_at.or(stats.armed_at) {
                if armed && now - since > overdue_after {
                    status = Health::Warning;
                    reasons.push(format!("no successful run for {}s", now - since));
                }
            }
        }

        HealthReport {
            status,
            runs: stats.runs,
            failures: stats.failures,
            retry_count: stats.retry_count,
            last_run_at: stats.last_run_at,
            last_success_at: stats.last_success_at,
            last_error: stats.last_error.clone(),
            reasons,
        }
    }
}

/// Clears the in-progress flag when a tick ends, including when the tick
/// future is dropped by `stop`.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Drop for MaintenanceScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use std::sync::atomic::AtomicUsize;

    struct FlakyJob {
        calls: AtomicUsize,
        fail: AtomicBool,
        delay: Duration,
    }

    #[async_trait]
    impl MaintenanceJob for FlakyJob {
        fn name(&self) -> &'static str {
            "flaky"
        }
        async fn run(&self) -> Result<JobReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("boom");
            }
            Ok(JobReport::default())
        }
    }

    fn flaky(fail: bool, delay_ms: u64) -> Arc<FlakyJob> {
        Arc::new(FlakyJob {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(fail),
            delay: Duration::from_millis(delay_ms),
        })
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_rejected() {
        let job = flaky(false, 50);
        let scheduler = MaintenanceScheduler::new(job.clone(), MaintenanceConfig::default());
        let (a, b) = tokio::join!(scheduler.tick(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            scheduler.tick().await
        });
        assert!(matches!(a, TickOutcome::Completed(_)));
        assert_eq!(b, TickOutcome::Rejected);
        assert_eq!(job.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_counter_is_bounded_and_resets() {
        let job = flaky(true, 0);
        let config = MaintenanceConfig {
            max_retries: 2,
            ..Default::default()
        };
        let scheduler = MaintenanceScheduler::new(job.clone(), config);
        for _ in 0..4 {
            assert!(matches!(scheduler.tick().await, TickOutcome::Failed(_)));
        }
        let health = scheduler.health();
        assert_eq!(health.retry_count, 2);
        assert_eq!(health.failures, 4);
        assert_eq!(health.status, Health::Warning);

        job.fail.store(false, Ordering::SeqCst);
        scheduler.tick().await;
        assert_eq!(scheduler.health().retry_count, 0);
    }

    #[tokio::test]
    async fn test_enabled_but_not_started_is_error() {
        let config = MaintenanceConfig {
            enabled: true,
            ..Default::default()
        };
        let scheduler = MaintenanceScheduler::new(flaky(false, 0), config);
        assert_eq!(scheduler.health().status, Health::Error);
        assert!(scheduler.start());
        assert!(!scheduler.start());
        assert_eq!(scheduler.health().status, Health::Healthy);
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_overdue_is_warning() {
        let config = MaintenanceConfig {
            interval_secs: 10,
            overdue_factor: 2.0,
            ..Default::default()
        };
        let scheduler = MaintenanceScheduler::new(flaky(false, 0), config);
        scheduler.start();
        assert_eq!(scheduler.health_at(now_ts() + 5).status, Health::Healthy);
        assert_eq!(scheduler.health_at(now_ts() + 60).status, Health::Warning);
        scheduler.stop();
    }

    struct PanicOnceJob {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MaintenanceJob for PanicOnceJob {
        fn name(&self) -> &'static str {
            "panic-once"
        }
        async fn run(&self) -> Result<JobReport> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("job blew up");
            }
            Ok(JobReport::default())
        }
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_block_later_ticks() {
        let job = Arc::new(PanicOnceJob {
            calls: AtomicUsize::new(0),
        });
        let scheduler = MaintenanceScheduler::new(job.clone(), MaintenanceConfig::default());
        match scheduler.tick().await {
            TickOutcome::Failed(msg) => assert!(msg.contains("panicked")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(matches!(scheduler.tick().await, TickOutcome::Completed(_)));
        assert_eq!(job.calls.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.health().failures, 1);
    }

    #[tokio::test]
    async fn test_zero_retries_keeps_running_while_healthy() {
        let config = MaintenanceConfig {
            enabled: true,
            interval_secs: 1,
            max_retries: 0,
            ..Default::default()
        };
        let scheduler = MaintenanceScheduler::new(flaky(false, 0), config);
        assert!(scheduler.start());
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let health = scheduler.health();
        assert_eq!(health.runs, 1);
        assert!(scheduler.is_armed());
        assert_eq!(health.status, Health::Healthy);
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_zero_retries_stops_on_first_failure() {
        let config = MaintenanceConfig {
            enabled: true,
            interval_secs: 1,
            max_retries: 0,
            ..Default::default()
        };
        let scheduler = MaintenanceScheduler::new(flaky(true, 0), config);
        assert!(scheduler.start());
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(!scheduler.is_armed());
        let health = scheduler.health();
        assert_eq!(health.failures, 1);
        assert_eq!(health.status, Health::Error);
    }

    #[tokio::test]
    async fn test_tag_degradation() {
        let tmp = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(
            StorageCoordinator::initialize(tmp.path(), &DbConfig::default())
                .await
                .unwrap(),
        );
        let old = now_ts() - 90 * 86_400;
        let pool = storage.meta().pool().clone();
        for (name, weight, used) in [("stale", 0.105, old), ("fresh", 1.0, now_ts()), ("kept", 0.05, old)] {
            sqlx::query("INSERT INTO tags (name, weight, usage_count, last_used_at, created_at) VALUES (?, ?, 1, ?, ?)")
                .bind(name)
                .bind(weight)
                .bind(used)
                .bind(used)
                .execute(&pool)
                .await
                .unwrap();
        }
        sqlx::query(
            "INSERT INTO notes (id, title, content, tags_json, created_at, updated_at) VALUES ('note_1', 't', 'c', '[\"kept\"]', 0, 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let job = TagDegradationJob::new(Arc::clone(&storage), &MaintenanceConfig::default());
        let report = job.run().await.unwrap();
        assert_eq!(report.updated, 2);
        assert_eq!(report.deleted, 1);

        let names: Vec<String> = sqlx::query_scalar("SELECT name FROM tags ORDER BY name")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(names, vec!["fresh".to_string(), "kept".to_string()]);
    }
}

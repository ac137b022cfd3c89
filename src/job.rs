/// Job coordination module
///
/// One job run: snapshot the due feeds, fan one task per feed out across
/// the worker pool, harvest results in submission order with a per-task
/// timeout, and fold everything into a single mergeable JobResult. The
/// operator lock is observed before the run and between harvests.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::delivery::Delivery;
use crate::feed::Feed;
use crate::fetcher::CandidateFetcher;
use crate::frequency;
use crate::lock::GlobalLock;
use crate::notify::Notify;
use crate::pool::{PoolError, WorkerPool};
use crate::source::ContentSource;
use crate::storage::Storage;
use crate::task::{FeedTask, InterruptFlag, TaskOutcome};

/// Mergeable summary of one feed task or one whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub posted_count: u64,
    pub posted_bytes: f64,
    pub canceled: bool,
    /// Deepest 0-based listing index any task looked at; -1 when nothing
    /// was inspected.
    pub max_seen_index: i64,
}

impl Default for JobResult {
    fn default() -> Self {
        JobResult {
            posted_count: 0,
            posted_bytes: 0.0,
            canceled: false,
            max_seen_index: -1,
        }
    }
}

impl JobResult {
    pub fn canceled() -> Self {
        JobResult {
            canceled: true,
            ..Default::default()
        }
    }

    /// Fold another result in. Associative and commutative, so feed-level
    /// results can be merged in any order.
    pub fn merge(mut self, other: &JobResult) -> JobResult {
        self.posted_count += other.posted_count;
        self.posted_bytes += other.posted_bytes;
        self.canceled = self.canceled || other.canceled;
        self.max_seen_index = self.max_seen_index.max(other.max_seen_index);
        self
    }
}

/// Persisted record of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub selected: u32,
    pub completed: u32,
    pub result: JobResult,
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Harvest deadline per feed task; defaults to the scheduling interval.
    pub feed_timeout: Duration,
    /// Pause between consecutive posts inside one feed task.
    pub post_cooldown: Duration,
    /// Worker pool size as a multiple of available CPUs.
    pub pool_cpu_multiplier: usize,
    /// Source client identity recorded in the request ledger.
    pub client_name: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        JobConfig {
            feed_timeout: Duration::from_secs(600),
            post_cooldown: Duration::from_secs(2),
            pool_cpu_multiplier: 2,
            client_name: "default".to_string(),
        }
    }
}

pub struct JobCoordinator {
    storage: Arc<dyn Storage>,
    source: Arc<dyn ContentSource>,
    delivery: Arc<dyn Delivery>,
    lock: Arc<dyn GlobalLock>,
    notifier: Arc<dyn Notify>,
    config: JobConfig,
    /// Interrupt flags of the current run's tasks, for the administrative
    /// drain path.
    interrupts: Mutex<Vec<InterruptFlag>>,
}

impl JobCoordinator {
    pub fn new(
        storage: Arc<dyn Storage>,
        source: Arc<dyn ContentSource>,
        delivery: Arc<dyn Delivery>,
        lock: Arc<dyn GlobalLock>,
        notifier: Arc<dyn Notify>,
        config: JobConfig,
    ) -> Self {
        JobCoordinator {
            storage,
            source,
            delivery,
            lock,
            notifier,
            config,
            interrupts: Mutex::new(Vec::new()),
        }
    }

    /// Ask every task of the current run to stop at its next safe point.
    /// Administrative escape hatch for lock-and-drain flows.
    pub fn request_interrupt_all(&self) {
        let interrupts = self.interrupts.lock().unwrap();
        for flag in interrupts.iter() {
            flag.set();
        }
        log::info!("Interrupt requested for {} tasks", interrupts.len());
    }

    /// Execute one full job run.
    ///
    /// Harvesting is strictly in submission order even though tasks finish
    /// out of order; a slow early task delays visibility into later ones.
    /// Harvesting in completion order would be faster but changes the
    /// observable progress semantics, so it is left as a possible future
    /// change.
    pub async fn run_once(&self) -> Result<JobResult> {
        if self.lock.is_locked().await? {
            log::info!("Scheduler is paused, skipping run");
            return Ok(JobResult::canceled());
        }

        let now = Utc::now();
        let feeds = self.storage.list_enabled_feeds_with_channel().await?;
        let due: Vec<Feed> = feeds
            .into_iter()
            .filter(|feed| frequency::is_due(feed, now))
            .collect();

        if due.is_empty() {
            log::debug!("No feeds due this run");
            return Ok(JobResult::default());
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let selected = due.len() as u32;
        log::info!("Run {}: {} feeds due", run_id, selected);
        self.storage.save_progress(run_id, selected, 0).await?;

        let pool = WorkerPool::with_cpu_multiple(self.config.pool_cpu_multiplier);

        let mut submitted = Vec::with_capacity(due.len());
        {
            let mut interrupts = self.interrupts.lock().unwrap();
            interrupts.clear();
            for feed in due {
                let fetcher = CandidateFetcher::new(
                    self.storage.clone(),
                    self.source.clone(),
                    &self.config.client_name,
                );
                let task = FeedTask::new(
                    feed.clone(),
                    self.storage.clone(),
                    fetcher,
                    self.delivery.clone(),
                    self.config.post_cooldown,
                );
                let flag = task.interrupt_flag();
                interrupts.push(flag.clone());
                let handle = pool.submit(task.run())?;
                submitted.push((feed, flag, handle));
            }
        }

        let mut aggregate = JobResult::default();
        let mut completed = 0u32;

        for (feed, flag, mut handle) in submitted {
            // An operator engaging the lock mid-run aborts the harvest
            // right away; in-flight tasks run to completion on their own.
            if self.lock.is_locked().await? {
                log::warn!("Scheduler lock engaged mid-run, abandoning harvest");
                aggregate.canceled = true;
                break;
            }

            match pool.await_result(&mut handle, self.config.feed_timeout).await {
                Ok(TaskOutcome::Completed(result)) => {
                    aggregate = aggregate.merge(&result);
                }
                Ok(TaskOutcome::Skipped) => {
                    log::debug!("[{}] task skipped before starting", feed.name);
                }
                Ok(TaskOutcome::Failed(e)) => {
                    log::error!("[{}] task failed: {:#}", feed.name, e);
                    if let Err(notify_err) =
                        self.notifier.feed_error(&feed, &format!("{:#}", e)).await
                    {
                        log::warn!("Failed to report feed error: {:#}", notify_err);
                    }
                }
                Err(PoolError::Timeout) => {
                    flag.set();
                    handle.cancel();
                    log::error!(
                        "[{}] did not finish within {:?}, interrupt requested",
                        feed.name,
                        self.config.feed_timeout
                    );
                    if let Err(notify_err) = self.notifier.feed_timeout(&feed).await {
                        log::warn!("Failed to report feed timeout: {:#}", notify_err);
                    }
                }
                Err(e) => {
                    log::error!("[{}] harvest failed: {}", feed.name, e);
                    if let Err(notify_err) =
                        self.notifier.feed_error(&feed, &e.to_string()).await
                    {
                        log::warn!("Failed to report feed error: {:#}", notify_err);
                    }
                }
            }

            completed += 1;
            if let Err(e) = self.storage.save_progress(run_id, selected, completed).await {
                log::error!("Failed to persist run progress: {:#}", e);
            }
        }

        pool.close();

        let finished_at = Utc::now();
        let summary = JobSummary {
            run_id,
            started_at,
            finished_at: Some(finished_at),
            duration_secs: Some((finished_at - started_at).num_milliseconds() as f64 / 1000.0),
            selected,
            completed,
            result: aggregate.clone(),
        };
        if let Err(e) = self.storage.finish_run(&summary).await {
            log::error!("Failed to persist run summary: {:#}", e);
        }

        log::info!(
            "Run {} done: {}/{} feeds, {} posted, canceled: {}",
            run_id,
            completed,
            selected,
            aggregate.posted_count,
            aggregate.canceled
        );

        Ok(aggregate)
    }

    #[cfg(test)]
    fn interrupt_states(&self) -> Vec<bool> {
        self.interrupts
            .lock()
            .unwrap()
            .iter()
            .map(|flag| flag.is_set())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliveryHandle, PostContent};
    use crate::feed::Sorting;
    use crate::lock::MemoryLock;
    use crate::notify::MemoryNotifier;
    use crate::source::Candidate;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn result(posted: u64, bytes: f64, canceled: bool, seen: i64) -> JobResult {
        JobResult {
            posted_count: posted,
            posted_bytes: bytes,
            canceled,
            max_seen_index: seen,
        }
    }

    #[test]
    fn merge_is_associative_and_commutative() {
        let a = result(1, 10.0, false, 2);
        let b = result(2, 20.0, true, 7);
        let c = result(3, 5.0, false, -1);

        let left = a.clone().merge(&b).merge(&c);
        let right = a.clone().merge(&b.clone().merge(&c));
        assert_eq!(left, right);

        let ab = a.clone().merge(&b);
        let ba = b.clone().merge(&a);
        assert_eq!(ab, ba);

        assert_eq!(left.posted_count, 6);
        assert_eq!(left.posted_bytes, 35.0);
        assert!(left.canceled);
        assert_eq!(left.max_seen_index, 7);
    }

    #[test]
    fn merge_with_empty_is_identity() {
        let a = result(4, 2.5, false, 3);
        assert_eq!(a.clone().merge(&JobResult::default()), a);
        assert_eq!(JobResult::default().merge(&a), a);
    }

    /// Per-feed behavior switch for the coordinator tests.
    struct ScriptedSource {
        slow_feed: Option<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ContentSource for ScriptedSource {
        async fn list_candidates(&self, feed: &str, _: Sorting, _: u32) -> Result<Vec<Candidate>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.slow_feed.as_deref() == Some(feed) {
                // Far beyond any test timeout; the task is reclaimed only
                // via the harvest deadline.
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(vec![Candidate {
                id: format!("{}-item", feed),
                title: format!("from {}", feed),
                score: 50,
                created_at: Utc::now() - ChronoDuration::hours(2),
                is_pinned: false,
                is_adult: false,
                is_image: false,
                url: format!("https://example.com/{}", feed),
                permalink: format!("https://www.reddit.com/r/{}/x", feed),
                author: "author".into(),
                raw_size: 10,
            }])
        }
    }

    struct CountingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Delivery for CountingSink {
        async fn send(&self, _: i64, content: &PostContent) -> Result<DeliveryHandle> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(DeliveryHandle {
                message_id: call as i32,
                byte_size: content.byte_size(),
            })
        }
    }

    fn coordinator(
        storage: Arc<MemoryStorage>,
        source: Arc<ScriptedSource>,
        lock: Arc<dyn GlobalLock>,
        notifier: Arc<MemoryNotifier>,
        feed_timeout: Duration,
    ) -> JobCoordinator {
        JobCoordinator::new(
            storage,
            source,
            Arc::new(CountingSink {
                calls: AtomicUsize::new(0),
            }),
            lock,
            notifier,
            JobConfig {
                feed_timeout,
                post_cooldown: Duration::ZERO,
                pool_cpu_multiplier: 2,
                client_name: "default".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn engaged_lock_short_circuits_the_run() {
        let storage = Arc::new(MemoryStorage::new());
        storage.save_feed(&Feed::new("pics", 10)).await.unwrap();

        let source = Arc::new(ScriptedSource {
            slow_feed: None,
            calls: AtomicUsize::new(0),
        });
        let coordinator = coordinator(
            storage.clone(),
            source.clone(),
            Arc::new(MemoryLock::locked(true)),
            Arc::new(MemoryNotifier::new()),
            Duration::from_secs(5),
        );

        let result = coordinator.run_once().await.unwrap();
        assert!(result.canceled);
        assert_eq!(result.posted_count, 0);
        // No feed submissions happened at all.
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert_eq!(storage.request_count(), 0);
    }

    #[tokio::test]
    async fn slow_feed_times_out_without_harming_the_rest() {
        let storage = Arc::new(MemoryStorage::new());
        // Harvest order follows load order, which is sorted by id, so the
        // slow feed is harvested first.
        storage.save_feed(&Feed::new("a_slow", 10)).await.unwrap();
        storage.save_feed(&Feed::new("b_fast", 11)).await.unwrap();

        let source = Arc::new(ScriptedSource {
            slow_feed: Some("a_slow".to_string()),
            calls: AtomicUsize::new(0),
        });
        let notifier = Arc::new(MemoryNotifier::new());
        let coordinator = coordinator(
            storage.clone(),
            source,
            Arc::new(MemoryLock::new()),
            notifier.clone(),
            Duration::from_millis(150),
        );

        let result = coordinator.run_once().await.unwrap();
        assert_eq!(result.posted_count, 1);
        assert!(!result.canceled);

        // The slow task got exactly one interrupt request, the fast one none.
        assert_eq!(coordinator.interrupt_states(), vec![true, false]);
        assert_eq!(notifier.reports(), vec!["timeout:a_slow".to_string()]);

        let summary = storage.latest_run().await.unwrap().unwrap();
        assert_eq!(summary.selected, 2);
        assert_eq!(summary.completed, 2);
    }

    #[tokio::test]
    async fn lock_engaged_mid_harvest_aborts_early() {
        /// Reports unlocked for the first N checks, locked afterwards.
        struct LockAfter {
            checks: AtomicUsize,
            threshold: usize,
        }

        #[async_trait]
        impl GlobalLock for LockAfter {
            async fn is_locked(&self) -> Result<bool> {
                let check = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(check > self.threshold)
            }
            async fn lock(&self) -> Result<()> {
                Ok(())
            }
            async fn unlock(&self) -> Result<()> {
                Ok(())
            }
        }

        let storage = Arc::new(MemoryStorage::new());
        storage.save_feed(&Feed::new("a_first", 10)).await.unwrap();
        storage.save_feed(&Feed::new("b_second", 11)).await.unwrap();

        let source = Arc::new(ScriptedSource {
            slow_feed: None,
            calls: AtomicUsize::new(0),
        });
        // Check 1: run start. Check 2: before first harvest. Check 3
        // (before the second harvest) reports locked.
        let lock = Arc::new(LockAfter {
            checks: AtomicUsize::new(0),
            threshold: 2,
        });
        let coordinator = coordinator(
            storage.clone(),
            source,
            lock,
            Arc::new(MemoryNotifier::new()),
            Duration::from_secs(5),
        );

        let result = coordinator.run_once().await.unwrap();
        assert!(result.canceled);
        assert_eq!(result.posted_count, 1);

        let summary = storage.latest_run().await.unwrap().unwrap();
        assert_eq!(summary.selected, 2);
        assert_eq!(summary.completed, 1);
        assert!(summary.result.canceled);
    }

    #[tokio::test]
    async fn feeds_not_due_are_not_dispatched() {
        let storage = Arc::new(MemoryStorage::new());
        let mut fresh = Feed::new("a_recent", 10);
        fresh.last_post_time = Some(Utc::now() - ChronoDuration::minutes(5));
        fresh.max_frequency = 60;
        storage.save_feed(&fresh).await.unwrap();
        storage.save_feed(&Feed::new("b_due", 11)).await.unwrap();

        let source = Arc::new(ScriptedSource {
            slow_feed: None,
            calls: AtomicUsize::new(0),
        });
        let coordinator = coordinator(
            storage.clone(),
            source.clone(),
            Arc::new(MemoryLock::new()),
            Arc::new(MemoryNotifier::new()),
            Duration::from_secs(5),
        );

        let result = coordinator.run_once().await.unwrap();
        assert_eq!(result.posted_count, 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        let summary = storage.latest_run().await.unwrap().unwrap();
        assert_eq!(summary.selected, 1);
    }
}

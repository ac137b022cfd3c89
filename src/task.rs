/// Feed task module
///
/// The unit of work dispatched to the worker pool: fetch fresh candidates
/// for one feed, filter them, post the accepted ones, and record posted
/// state. A task cannot be killed once running; it carries a cooperative
/// interrupt flag checked at its safe points instead.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::delivery::{format_candidate, Delivery};
use crate::feed::Feed;
use crate::fetcher::CandidateFetcher;
use crate::filter;
use crate::job::JobResult;
use crate::storage::Storage;

/// Cooperative cancellation signal shared between a running task and the
/// coordinator that may give up on it.
#[derive(Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Terminal state of one feed task.
pub enum TaskOutcome {
    Completed(JobResult),
    /// The task never ran (canceled while queued, or pool shut down).
    Skipped,
    Failed(anyhow::Error),
}

impl Default for TaskOutcome {
    fn default() -> Self {
        TaskOutcome::Skipped
    }
}

pub struct FeedTask {
    feed: Feed,
    storage: Arc<dyn Storage>,
    fetcher: CandidateFetcher,
    delivery: Arc<dyn Delivery>,
    interrupt: InterruptFlag,
    /// Pause between consecutive posts of one feed, throttling delivery.
    cooldown: Duration,
}

impl FeedTask {
    pub fn new(
        feed: Feed,
        storage: Arc<dyn Storage>,
        fetcher: CandidateFetcher,
        delivery: Arc<dyn Delivery>,
        cooldown: Duration,
    ) -> Self {
        FeedTask {
            feed,
            storage,
            fetcher,
            delivery,
            interrupt: InterruptFlag::new(),
            cooldown,
        }
    }

    pub fn interrupt_flag(&self) -> InterruptFlag {
        self.interrupt.clone()
    }

    pub async fn run(self) -> TaskOutcome {
        let feed_name = self.feed.name.clone();
        match self.execute().await {
            Ok(result) => {
                log::info!(
                    "[{}] task finished: {} posted, {:.0} bytes",
                    feed_name,
                    result.posted_count,
                    result.posted_bytes
                );
                TaskOutcome::Completed(result)
            }
            Err(e) => TaskOutcome::Failed(e),
        }
    }

    async fn execute(self) -> anyhow::Result<JobResult> {
        let mut result = JobResult::default();

        if self.interrupt.is_set() {
            return Ok(result);
        }

        let channel_id = match self.feed.channel_id {
            Some(id) => id,
            None => {
                log::warn!("[{}] no destination channel, nothing to do", self.feed.name);
                return Ok(result);
            }
        };

        // Source and storage errors propagate; the coordinator records them
        // as a per-feed failure without touching sibling feeds.
        let mut stream = self.fetcher.fetch(&self.feed).await?;
        let now = Utc::now();

        let mut accepted: Vec<crate::source::Candidate> = Vec::new();
        while accepted.len() < self.feed.number_of_posts as usize {
            if self.interrupt.is_set() {
                log::info!("[{}] interrupted while scanning candidates", self.feed.name);
                return Ok(result);
            }
            match stream.next().await? {
                None => break,
                Some((index, candidate)) => {
                    result.max_seen_index = result.max_seen_index.max(index as i64);
                    if filter::accepts(&self.feed, &candidate, now) {
                        accepted.push(candidate);
                    }
                }
            }
        }

        if accepted.is_empty() {
            log::debug!("[{}] no fresh candidates passed the filters", self.feed.name);
            return Ok(result);
        }

        let mut feed = self.feed.clone();
        for candidate in accepted {
            tokio::time::sleep(self.cooldown).await;

            if self.interrupt.is_set() {
                log::info!("[{}] interrupted before posting {}", feed.name, candidate.id);
                return Ok(result);
            }

            let content = format_candidate(&feed, &candidate);
            match self.delivery.send(channel_id, &content).await {
                Ok(handle) => {
                    log::info!(
                        "[{}] posted {} as message {}",
                        feed.name,
                        candidate.id,
                        handle.message_id
                    );
                    if !feed.test {
                        // Dedup and timestamp updates happen only after a
                        // successful delivery; a failure here must not
                        // abort the remaining candidates.
                        if let Err(e) = self.storage.record_posted(&feed.id, &candidate.id).await {
                            log::error!("[{}] failed to record posted item {}: {:#}", feed.name, candidate.id, e);
                        }
                        feed.last_post_time = Some(Utc::now());
                        if let Err(e) = self.storage.save_feed(&feed).await {
                            log::error!("[{}] failed to update last post time: {:#}", feed.name, e);
                        }
                    }
                    result.posted_count += 1;
                    result.posted_bytes += handle.byte_size;
                }
                Err(e) => {
                    // One bad candidate never takes down the rest.
                    log::error!("[{}] delivery failed for {}: {:#}", feed.name, candidate.id, e);
                }
            }
        }

        Ok(result)
    }
}

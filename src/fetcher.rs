/// Candidate fetcher module
///
/// Queries the content source for one feed and yields only fresh
/// candidates: items never posted to this feed before, and for long-window
/// top listings, items not captured in the feed's initial snapshot. The
/// stream is lazy so a task that fills its posting quota early stops
/// issuing dedup lookups.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;

use crate::feed::{Feed, Sorting};
use crate::source::{Candidate, ContentSource};
use crate::storage::Storage;

pub struct CandidateFetcher {
    storage: Arc<dyn Storage>,
    source: Arc<dyn ContentSource>,
    /// Client identity recorded in the request ledger for usage balancing.
    client_name: String,
}

impl CandidateFetcher {
    pub fn new(storage: Arc<dyn Storage>, source: Arc<dyn ContentSource>, client_name: &str) -> Self {
        CandidateFetcher {
            storage,
            source,
            client_name: client_name.to_string(),
        }
    }

    /// One source query per call; the returned stream is finite and not
    /// restartable. Source errors propagate to the caller.
    pub async fn fetch(&self, feed: &Feed) -> Result<CandidateStream> {
        self.storage
            .record_request(&feed.id, &self.client_name, Utc::now())
            .await?;

        let listing = self
            .source
            .list_candidates(&feed.id, feed.sorting, feed.limit)
            .await?;

        // First fetch of a top-month/top-all feed captures the current
        // listing instead of posting it: everything already at the top
        // predates the feed and would flood the channel.
        if feed.sorting.needs_initial_snapshot()
            && !self.storage.snapshot_exists(&feed.id, feed.sorting).await?
        {
            let ids: Vec<String> = listing.iter().map(|c| c.id.clone()).collect();
            self.storage
                .record_snapshot(&feed.id, feed.sorting, &ids)
                .await?;
            log::info!(
                "[{}] captured initial {} snapshot of {} items",
                feed.name,
                feed.sorting.as_str(),
                ids.len()
            );
        }

        Ok(CandidateStream {
            storage: self.storage.clone(),
            feed_id: feed.id.clone(),
            sorting: feed.sorting,
            check_snapshot: feed.sorting.needs_initial_snapshot(),
            items: listing.into_iter().enumerate().collect(),
            cursor: 0,
        })
    }
}

/// Lazy sequence of fresh candidates in source order. Each yielded item
/// carries its 0-based index in the raw listing so callers can track how
/// deep into the feed a run looked.
pub struct CandidateStream {
    storage: Arc<dyn Storage>,
    feed_id: String,
    sorting: Sorting,
    check_snapshot: bool,
    items: Vec<(usize, Candidate)>,
    cursor: usize,
}

impl CandidateStream {
    pub async fn next(&mut self) -> Result<Option<(usize, Candidate)>> {
        while self.cursor < self.items.len() {
            let (index, candidate) = self.items[self.cursor].clone();
            self.cursor += 1;

            if self.storage.already_posted(&self.feed_id, &candidate.id).await? {
                log::debug!("[{}] skipping {}: already posted", self.feed_id, candidate.id);
                continue;
            }

            if self.check_snapshot
                && self
                    .storage
                    .in_snapshot(&self.feed_id, self.sorting, &candidate.id)
                    .await?
            {
                log::debug!("[{}] skipping {}: in initial snapshot", self.feed_id, candidate.id);
                continue;
            }

            return Ok(Some((index, candidate)));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSource {
        candidates: Vec<Candidate>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ContentSource for FixedSource {
        async fn list_candidates(
            &self,
            _feed_name: &str,
            _sorting: Sorting,
            _limit: u32,
        ) -> Result<Vec<Candidate>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.candidates.clone())
        }
    }

    fn candidate(id: &str) -> Candidate {
        Candidate {
            id: id.into(),
            title: format!("title {}", id),
            score: 10,
            created_at: Utc::now() - Duration::hours(3),
            is_pinned: false,
            is_adult: false,
            is_image: false,
            url: format!("https://example.com/{}", id),
            permalink: format!("https://www.reddit.com/r/test/{}", id),
            author: "author".into(),
            raw_size: 42,
        }
    }

    #[tokio::test]
    async fn posted_ids_are_excluded() {
        let storage = Arc::new(MemoryStorage::new());
        storage.record_posted("testsub", "b").await.unwrap();

        let source = Arc::new(FixedSource {
            candidates: vec![candidate("a"), candidate("b"), candidate("c")],
            calls: AtomicUsize::new(0),
        });
        let fetcher = CandidateFetcher::new(storage.clone(), source, "default");
        let feed = Feed::new("testsub", 1);

        let mut stream = fetcher.fetch(&feed).await.unwrap();
        let mut seen = Vec::new();
        while let Some((index, c)) = stream.next().await.unwrap() {
            seen.push((index, c.id));
        }
        assert_eq!(seen, vec![(0, "a".to_string()), (2, "c".to_string())]);
        assert_eq!(storage.request_count(), 1);
    }

    #[tokio::test]
    async fn first_top_all_fetch_snapshots_everything() {
        let storage = Arc::new(MemoryStorage::new());
        let source = Arc::new(FixedSource {
            candidates: vec![candidate("old1"), candidate("old2")],
            calls: AtomicUsize::new(0),
        });
        let fetcher = CandidateFetcher::new(storage.clone(), source, "default");
        let mut feed = Feed::new("testsub", 1);
        feed.sorting = Sorting::TopAll;

        let mut stream = fetcher.fetch(&feed).await.unwrap();
        assert!(stream.next().await.unwrap().is_none());
        assert!(storage.snapshot_exists("testsub", Sorting::TopAll).await.unwrap());
    }

    #[tokio::test]
    async fn snapshot_only_masks_captured_ids() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .record_snapshot("testsub", Sorting::TopMonth, &["old".to_string()])
            .await
            .unwrap();

        let source = Arc::new(FixedSource {
            candidates: vec![candidate("old"), candidate("fresh")],
            calls: AtomicUsize::new(0),
        });
        let fetcher = CandidateFetcher::new(storage, source, "default");
        let mut feed = Feed::new("testsub", 1);
        feed.sorting = Sorting::TopMonth;

        let mut stream = fetcher.fetch(&feed).await.unwrap();
        let (_, first) = stream.next().await.unwrap().unwrap();
        assert_eq!(first.id, "fresh");
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hot_listing_never_touches_snapshots() {
        let storage = Arc::new(MemoryStorage::new());
        let source = Arc::new(FixedSource {
            candidates: vec![candidate("a")],
            calls: AtomicUsize::new(0),
        });
        let fetcher = CandidateFetcher::new(storage.clone(), source, "default");
        let feed = Feed::new("testsub", 1);

        let mut stream = fetcher.fetch(&feed).await.unwrap();
        assert!(stream.next().await.unwrap().is_some());
        assert!(!storage.snapshot_exists("testsub", Sorting::Hot).await.unwrap());
    }
}

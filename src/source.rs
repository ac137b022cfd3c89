/// Content source module
///
/// Fetches candidate submissions for a feed from the public Reddit JSON
/// listing API. The relay core only depends on the `ContentSource` trait;
/// the HTTP client here is the production implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::feed::{Feed, Sorting};

/// One submission fetched from the source, not yet vetted against the
/// feed's filters or the dedup table.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub title: String,
    pub score: i64,
    pub created_at: DateTime<Utc>,
    pub is_pinned: bool,
    pub is_adult: bool,
    pub is_image: bool,
    pub url: String,
    pub permalink: String,
    pub author: String,
    /// Approximate payload size in bytes, used for posted-bytes accounting.
    pub raw_size: u64,
}

/// Ordered candidate listing for one feed. Implementations may fail on
/// transport or auth errors; callers treat that as a per-feed failure.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn list_candidates(
        &self,
        feed_name: &str,
        sorting: Sorting,
        limit: u32,
    ) -> Result<Vec<Candidate>>;
}

/// Reddit listing API response structures (only the fields the relay uses)
#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    children: Vec<ListingChild>,
}

#[derive(Debug, Deserialize)]
struct ListingChild {
    data: Submission,
}

#[derive(Debug, Deserialize)]
struct Submission {
    id: String,
    title: String,
    score: i64,
    created_utc: f64,
    #[serde(default)]
    stickied: bool,
    #[serde(default)]
    over_18: bool,
    #[serde(default)]
    post_hint: Option<String>,
    #[serde(default)]
    url: String,
    #[serde(default)]
    permalink: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    selftext: String,
}

impl Submission {
    fn is_image(&self) -> bool {
        if self.post_hint.as_deref() == Some("image") {
            return true;
        }
        let url = self.url.to_lowercase();
        [".jpg", ".jpeg", ".png", ".gif", ".webp"]
            .iter()
            .any(|ext| url.ends_with(ext))
    }

    fn into_candidate(self) -> Candidate {
        let is_image = self.is_image();
        let created_at = DateTime::<Utc>::from_timestamp(self.created_utc as i64, 0)
            .unwrap_or_else(Utc::now);
        let raw_size = (self.title.len() + self.selftext.len() + self.url.len()) as u64;
        Candidate {
            id: self.id,
            title: self.title,
            score: self.score,
            created_at,
            is_pinned: self.stickied,
            is_adult: self.over_18,
            is_image,
            url: self.url,
            permalink: format!("https://www.reddit.com{}", self.permalink),
            author: self.author,
            raw_size,
        }
    }
}

/// HTTP client for the public listing endpoints.
pub struct RedditClient {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
}

impl RedditClient {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client for content source")?;

        Ok(RedditClient {
            client,
            base_url: "https://www.reddit.com".to_string(),
            user_agent: user_agent.to_string(),
        })
    }

    /// Point the client at a different host. Used by integration setups that
    /// front the listing API with a local stub.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl ContentSource for RedditClient {
    async fn list_candidates(
        &self,
        feed_name: &str,
        sorting: Sorting,
        limit: u32,
    ) -> Result<Vec<Candidate>> {
        let (path, window) = sorting.endpoint();
        let url = format!("{}/r/{}/{}.json", self.base_url, feed_name, path);

        log::debug!(
            "Fetching /r/{}/{} (limit: {}, window: {:?})",
            feed_name,
            path,
            limit,
            window
        );

        let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
        if let Some(t) = window {
            query.push(("t", t.to_string()));
        }

        let response = self
            .client
            .get(&url)
            .header("User-Agent", &self.user_agent)
            .query(&query)
            .send()
            .await
            .with_context(|| format!("Failed to fetch listing for r/{}", feed_name))?;

        // The listing API advertises its remaining quota; log it so usage
        // balancing across accounts can be observed.
        let rate_limit_remaining = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse::<f64>().ok());

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            let error_msg = match status.as_u16() {
                403 => format!(
                    "Forbidden (403) listing r/{}: the subreddit may be private, \
                    quarantined or banned. API response: {}",
                    feed_name, text
                ),
                404 => format!("Not found (404): r/{} does not exist", feed_name),
                429 => format!(
                    "Rate limited (429) listing r/{}. Slow the polling interval or \
                    spread feeds across more requests. API response: {}",
                    feed_name, text
                ),
                _ => format!("Listing API error for r/{}: {} - {}", feed_name, status, text),
            };
            anyhow::bail!("{}", error_msg);
        }

        if let Some(remaining) = rate_limit_remaining {
            log::debug!("Listing API rate limit: {:.0} requests remaining", remaining);
            if remaining < 5.0 {
                log::warn!("Listing API rate limit nearly exhausted ({:.0} left)", remaining);
            }
        }

        let listing: Listing = response
            .json()
            .await
            .with_context(|| format!("Failed to parse listing response for r/{}", feed_name))?;

        let candidates: Vec<Candidate> = listing
            .data
            .children
            .into_iter()
            .map(|child| child.data.into_candidate())
            .collect();

        log::debug!("Fetched {} candidates from r/{}", candidates.len(), feed_name);

        Ok(candidates)
    }
}

/// Build the listing request URL for a feed; kept separate so the path
/// logic is testable without a network stub.
pub fn listing_path(feed: &Feed) -> String {
    let (path, window) = feed.sorting.endpoint();
    match window {
        Some(t) => format!("/r/{}/{}.json?limit={}&t={}", feed.id, path, feed.limit, t),
        None => format!("/r/{}/{}.json?limit={}", feed.id, path, feed.limit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_path_includes_time_window_for_top() {
        let mut feed = Feed::new("earthporn", 1);
        feed.limit = 50;
        feed.sorting = Sorting::TopAll;
        assert_eq!(listing_path(&feed), "/r/earthporn/top.json?limit=50&t=all");

        feed.sorting = Sorting::Hot;
        assert_eq!(listing_path(&feed), "/r/earthporn/hot.json?limit=50");
    }

    #[test]
    fn submission_image_detection() {
        let mut sub = Submission {
            id: "abc".into(),
            title: "t".into(),
            score: 1,
            created_utc: 0.0,
            stickied: false,
            over_18: false,
            post_hint: None,
            url: "https://i.redd.it/xyz.png".into(),
            permalink: "/r/pics/abc".into(),
            author: "someone".into(),
            selftext: String::new(),
        };
        assert!(sub.is_image());

        sub.url = "https://example.com/article".into();
        assert!(!sub.is_image());

        sub.post_hint = Some("image".into());
        assert!(sub.is_image());
    }
}

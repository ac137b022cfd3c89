/// Delivery module
///
/// Sends formatted candidates to a feed's destination Telegram channel.
/// The relay core depends on the `Delivery` trait; `TelegramDelivery`
/// wraps teloxide for production use.

use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::InputFile;

use crate::feed::Feed;
use crate::source::Candidate;

/// Outcome of one successful send.
#[derive(Debug, Clone)]
pub struct DeliveryHandle {
    pub message_id: i32,
    pub byte_size: f64,
}

/// Message payload built from a candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct PostContent {
    pub text: String,
    pub image_url: Option<String>,
}

impl PostContent {
    pub fn byte_size(&self) -> f64 {
        self.text.len() as f64
    }
}

#[async_trait]
pub trait Delivery: Send + Sync {
    async fn send(&self, channel_id: i64, content: &PostContent) -> Result<DeliveryHandle>;
}

/// Format a candidate for its channel.
pub fn format_candidate(feed: &Feed, candidate: &Candidate) -> PostContent {
    let mut text = String::new();

    text.push_str(&candidate.title);
    text.push_str("\n\n");
    text.push_str(&format!(
        "▲ {} | by u/{} in r/{}\n",
        candidate.score, candidate.author, feed.id
    ));
    text.push_str(&candidate.permalink);

    let image_url = if candidate.is_image {
        Some(candidate.url.clone())
    } else {
        // Link posts carry the target URL in the body unless it is the
        // submission itself.
        if !candidate.url.is_empty() && candidate.url != candidate.permalink {
            text.push('\n');
            text.push_str(&candidate.url);
        }
        None
    };

    PostContent { text, image_url }
}

/// Telegram channel sender.
pub struct TelegramDelivery {
    bot: Bot,
}

impl TelegramDelivery {
    pub fn new(bot: Bot) -> Self {
        TelegramDelivery { bot }
    }
}

#[async_trait]
impl Delivery for TelegramDelivery {
    async fn send(&self, channel_id: i64, content: &PostContent) -> Result<DeliveryHandle> {
        let chat = ChatId(channel_id);

        let message = match &content.image_url {
            Some(image_url) => {
                let url = reqwest::Url::parse(image_url)
                    .with_context(|| format!("Invalid image URL: {}", image_url))?;
                self.bot
                    .send_photo(chat, InputFile::url(url))
                    .caption(content.text.clone())
                    .await
                    .context("Failed to send photo to channel")?
            }
            None => self
                .bot
                .send_message(chat, content.text.clone())
                .await
                .context("Failed to send message to channel")?,
        };

        Ok(DeliveryHandle {
            message_id: message.id.0,
            byte_size: content.byte_size(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candidate() -> Candidate {
        Candidate {
            id: "c1".into(),
            title: "Sunrise over the ridge".into(),
            score: 4211,
            created_at: Utc::now(),
            is_pinned: false,
            is_adult: false,
            is_image: true,
            url: "https://i.redd.it/c1.jpg".into(),
            permalink: "https://www.reddit.com/r/earthporn/c1".into(),
            author: "hiker".into(),
            raw_size: 2048,
        }
    }

    #[test]
    fn image_candidates_become_photo_posts() {
        let feed = Feed::new("earthporn", 1);
        let content = format_candidate(&feed, &candidate());
        assert_eq!(content.image_url.as_deref(), Some("https://i.redd.it/c1.jpg"));
        assert!(content.text.starts_with("Sunrise over the ridge"));
        assert!(content.text.contains("by u/hiker in r/earthporn"));
        assert!(content.text.contains("https://www.reddit.com/r/earthporn/c1"));
    }

    #[test]
    fn link_candidates_append_target_url() {
        let feed = Feed::new("news", 1);
        let mut c = candidate();
        c.is_image = false;
        c.url = "https://example.com/story".into();
        let content = format_candidate(&feed, &c);
        assert_eq!(content.image_url, None);
        assert!(content.text.ends_with("https://example.com/story"));
    }
}

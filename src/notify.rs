/// Notification module
///
/// Reports the failures worth a human's attention to the admin chat. Feed
/// timeouts are the one failure class that must reach an operator: they
/// signal a systemic slowdown rather than a bad candidate.

use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;

use crate::feed::Feed;

#[async_trait]
pub trait Notify: Send + Sync {
    async fn feed_timeout(&self, feed: &Feed) -> Result<()>;
    async fn feed_error(&self, feed: &Feed, error: &str) -> Result<()>;
}

/// Sends reports to a configured admin chat; with no chat configured it
/// only logs, so deployments without an admin channel still run.
pub struct TelegramNotifier {
    bot: Bot,
    admin_chat_id: Option<i64>,
}

impl TelegramNotifier {
    pub fn new(bot: Bot, admin_chat_id: Option<i64>) -> Self {
        TelegramNotifier { bot, admin_chat_id }
    }

    async fn send(&self, text: String) -> Result<()> {
        match self.admin_chat_id {
            Some(chat_id) => {
                self.bot.send_message(ChatId(chat_id), text).await?;
            }
            None => log::warn!("No admin chat configured, dropping report: {}", text),
        }
        Ok(())
    }
}

#[async_trait]
impl Notify for TelegramNotifier {
    async fn feed_timeout(&self, feed: &Feed) -> Result<()> {
        self.send(format!(
            "⏱ Feed '{}' timed out and was asked to stop. \
            Its worker may still be finishing in the background.",
            feed.name
        ))
        .await
    }

    async fn feed_error(&self, feed: &Feed, error: &str) -> Result<()> {
        self.send(format!("❌ Feed '{}' failed: {}", feed.name, error))
            .await
    }
}

/// Recording notifier used by tests.
#[derive(Default)]
pub struct MemoryNotifier {
    pub reports: std::sync::Mutex<Vec<String>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<String> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notify for MemoryNotifier {
    async fn feed_timeout(&self, feed: &Feed) -> Result<()> {
        self.reports
            .lock()
            .unwrap()
            .push(format!("timeout:{}", feed.id));
        Ok(())
    }

    async fn feed_error(&self, feed: &Feed, error: &str) -> Result<()> {
        self.reports
            .lock()
            .unwrap()
            .push(format!("error:{}:{}", feed.id, error));
        Ok(())
    }
}

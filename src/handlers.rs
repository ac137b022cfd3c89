/// Command handlers module
///
/// This module handles:
/// - Administrative commands (pause/resume/drain the scheduler, force a run)
/// - Status reporting (lock state, configured feeds, latest run)
/// - Guarding mutating commands to the configured admin chat

use anyhow::Result;
use std::sync::Arc;
use teloxide::prelude::*;

use crate::job::JobCoordinator;
use crate::lock::GlobalLock;
use crate::scheduler;
use crate::storage::Storage;

/// Shared state handed to every command handler.
pub struct AppContext {
    pub storage: Arc<dyn Storage>,
    pub lock: Arc<dyn GlobalLock>,
    pub coordinator: Arc<JobCoordinator>,
    pub admin_chat_id: Option<i64>,
}

impl AppContext {
    /// Mutating commands are restricted to the admin chat when one is
    /// configured; otherwise any chat may drive the bot.
    fn is_admin(&self, chat_id: i64) -> bool {
        match self.admin_chat_id {
            Some(admin) => chat_id == admin,
            None => true,
        }
    }
}

async fn reject_non_admin(bot: &Bot, msg: &Message) -> Result<()> {
    bot.send_message(msg.chat.id, "This command is restricted to the admin chat.")
        .await?;
    Ok(())
}

/// Handle the /start command
pub async fn handle_start_command(bot: Bot, msg: Message) -> Result<()> {
    let welcome_message = "👋 Hello! I'm a feed relay bot.\n\n\
        I poll configured source feeds on a schedule and post fresh \
        submissions to their Telegram channels.\n\n\
        Use /help to see what I can do.";

    bot.send_message(msg.chat.id, welcome_message).await?;

    Ok(())
}

/// Handle the /help command
pub async fn handle_help_command(bot: Bot, msg: Message) -> Result<()> {
    let help_message = "ℹ️ Feed relay bot\n\n\
        Commands:\n\
        /start - Welcome message\n\
        /help - Show this help message\n\
        /status - Scheduler state and latest run\n\
        /pause - Pause the posting scheduler\n\
        /resume - Resume the posting scheduler\n\
        /drain - Pause and ask running feed tasks to stop\n\
        /forcerun - Trigger a posting run now\n\n\
        Scheduled runs are skipped while the scheduler is paused; feeds \
        keep their posting history either way.";

    bot.send_message(msg.chat.id, help_message).await?;

    Ok(())
}

/// Handle the /status command
pub async fn handle_status_command(bot: Bot, msg: Message, ctx: Arc<AppContext>) -> Result<()> {
    let locked = ctx.lock.is_locked().await?;
    let feeds = ctx.storage.list_enabled_feeds_with_channel().await?;
    let latest = ctx.storage.latest_run().await?;

    let mut text = format!(
        "Scheduler: {}\nConfigured feeds: {}\n",
        if locked { "⏸ paused" } else { "▶️ running" },
        feeds.len()
    );

    match latest {
        Some(run) => {
            text.push_str(&format!(
                "Latest run: {}/{} feeds, {} posted, canceled: {}\n",
                run.completed, run.selected, run.result.posted_count, run.result.canceled
            ));
            match run.finished_at {
                Some(finished) => {
                    text.push_str(&format!("Finished: {}", finished.format("%Y-%m-%d %H:%M:%S UTC")))
                }
                None => text.push_str("Still in progress"),
            }
        }
        None => text.push_str("No runs recorded yet"),
    }

    bot.send_message(msg.chat.id, text).await?;

    Ok(())
}

/// Handle the /pause command
pub async fn handle_pause_command(bot: Bot, msg: Message, ctx: Arc<AppContext>) -> Result<()> {
    if !ctx.is_admin(msg.chat.id.0) {
        return reject_non_admin(&bot, &msg).await;
    }

    ctx.lock.lock().await?;
    log::info!("Scheduler paused via chat command (chat {})", msg.chat.id);

    bot.send_message(
        msg.chat.id,
        "⏸ Scheduler paused. A run in progress will stop before its next feed.",
    )
    .await?;

    Ok(())
}

/// Handle the /resume command
pub async fn handle_resume_command(bot: Bot, msg: Message, ctx: Arc<AppContext>) -> Result<()> {
    if !ctx.is_admin(msg.chat.id.0) {
        return reject_non_admin(&bot, &msg).await;
    }

    ctx.lock.unlock().await?;
    log::info!("Scheduler resumed via chat command (chat {})", msg.chat.id);

    bot.send_message(msg.chat.id, "▶️ Scheduler resumed.").await?;

    Ok(())
}

/// Handle the /drain command: pause and interrupt whatever is running.
pub async fn handle_drain_command(bot: Bot, msg: Message, ctx: Arc<AppContext>) -> Result<()> {
    if !ctx.is_admin(msg.chat.id.0) {
        return reject_non_admin(&bot, &msg).await;
    }

    ctx.lock.lock().await?;
    ctx.coordinator.request_interrupt_all();
    log::info!("Scheduler drained via chat command (chat {})", msg.chat.id);

    bot.send_message(
        msg.chat.id,
        "⏸ Scheduler paused and running feed tasks asked to stop at their next safe point.",
    )
    .await?;

    Ok(())
}

/// Handle the /forcerun command
pub async fn handle_forcerun_command(bot: Bot, msg: Message, ctx: Arc<AppContext>) -> Result<()> {
    if !ctx.is_admin(msg.chat.id.0) {
        return reject_non_admin(&bot, &msg).await;
    }

    log::info!("Posting run triggered via chat command (chat {})", msg.chat.id);
    bot.send_message(msg.chat.id, "Starting a posting run...").await?;

    match scheduler::run_job(&ctx.coordinator).await {
        Ok(result) => {
            let text = if result.canceled {
                "Run ended early: the scheduler is paused.".to_string()
            } else {
                format!(
                    "✅ Run complete: {} posted, {:.0} bytes.",
                    result.posted_count, result.posted_bytes
                )
            };
            bot.send_message(msg.chat.id, text).await?;
        }
        Err(e) => {
            log::error!("Forced run failed: {:#}", e);
            bot.send_message(msg.chat.id, format!("❌ Run failed: {}", e))
                .await?;
        }
    }

    Ok(())
}

/// Feed Relay Bot
///
/// A Telegram bot that relays submissions from configured source feeds
/// (subreddits) into Telegram channels.
///
/// The bot:
/// - Polls each enabled feed on a fixed interval, respecting per-feed
///   frequency and quiet-hours settings
/// - Filters and deduplicates candidates before posting
/// - Fans feeds out across a bounded worker pool with per-feed timeouts
/// - Lets administrators pause, resume and force runs from chat

use anyhow::Result;
use feedrelay_bot::{bot, config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    pretty_env_logger::init();

    log::info!("Starting Feed Relay Bot...");

    // Load configuration from environment
    let cfg = config::Config::from_env()?;

    // Validate configuration and connections
    cfg.validate().await?;

    // Run the bot
    bot::run_bot(cfg).await?;

    Ok(())
}

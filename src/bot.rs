/// Telegram bot module
///
/// This module sets up and runs the Telegram bot using the teloxide
/// framework. It wires all the pieces together: configuration, storage,
/// the content source, the delivery client, the job coordinator, the
/// scheduler and the HTTP status server.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use teloxide::{prelude::*, types::Me, utils::command::BotCommands};
use tokio::time::sleep;

use crate::config::Config;
use crate::delivery::TelegramDelivery;
use crate::handlers::{
    handle_drain_command, handle_forcerun_command, handle_help_command, handle_pause_command,
    handle_resume_command, handle_start_command, handle_status_command, AppContext,
};
use crate::http_server;
use crate::job::JobCoordinator;
use crate::lock::PgLock;
use crate::notify::TelegramNotifier;
use crate::scheduler;
use crate::source::RedditClient;
use crate::storage::PgStorage;

/// Bot commands that administrators can use
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
pub enum Command {
    #[command(description = "Start the bot and see welcome message")]
    Start,
    #[command(description = "Show help information")]
    Help,
    #[command(description = "Show scheduler state and latest run")]
    Status,
    #[command(description = "Pause the posting scheduler")]
    Pause,
    #[command(description = "Resume the posting scheduler")]
    Resume,
    #[command(description = "Pause and stop running feed tasks")]
    Drain,
    #[command(description = "Trigger a posting run now")]
    Forcerun,
}

/// Initialize and run the Telegram bot together with the scheduler and the
/// HTTP status server.
pub async fn run_bot(config: Config) -> Result<()> {
    log::info!("Initializing bot...");

    // Build client with settings that survive slow cloud networking
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .context("Failed to create HTTP client")?;

    let bot = Bot::with_client(&config.telegram_token, client);

    // Get bot info with retry logic for network issues
    let me = retry_get_me(&bot)
        .await
        .context("Failed to connect to Telegram API after multiple retries")?;
    log::info!("Bot started: @{}", me.username());

    // Storage and the persisted scheduler lock share one pool
    let storage = Arc::new(PgStorage::connect(&config.database_url).await?);
    storage.initialize_schema().await?;
    let lock = Arc::new(PgLock::new(storage.pool().clone()));

    let source = Arc::new(RedditClient::new(&config.source_user_agent)?);
    let delivery = Arc::new(TelegramDelivery::new(bot.clone()));
    let notifier = Arc::new(TelegramNotifier::new(bot.clone(), config.admin_chat_id));

    let coordinator = Arc::new(JobCoordinator::new(
        storage.clone(),
        source,
        delivery,
        lock.clone(),
        notifier,
        config.job_config(),
    ));

    let ctx = Arc::new(AppContext {
        storage: storage.clone(),
        lock: lock.clone(),
        coordinator: coordinator.clone(),
        admin_chat_id: config.admin_chat_id,
    });

    // HTTP status server
    let http_state = http_server::AppState {
        storage,
        lock,
        coordinator: coordinator.clone(),
        run_api_secret: config.run_api_secret.clone(),
    };
    let http_port = config.http_port;
    tokio::spawn(async move {
        if let Err(e) = http_server::start_server(http_state, http_port).await {
            log::error!("HTTP server exited: {:#}", e);
        }
    });

    // Posting scheduler
    let interval = config.scheduler_interval_minutes;
    let scheduler_coordinator = coordinator.clone();
    tokio::spawn(async move {
        if let Err(e) = scheduler::start_scheduler(scheduler_coordinator, interval).await {
            log::error!("Scheduler exited: {:#}", e);
        }
    });

    // Set up command handler
    let handler = dptree::entry().branch(
        Update::filter_message()
            .filter_command::<Command>()
            .endpoint(
                |bot: Bot, msg: Message, cmd: Command, ctx: Arc<AppContext>| async move {
                    match cmd {
                        Command::Start => handle_start_command(bot, msg).await,
                        Command::Help => handle_help_command(bot, msg).await,
                        Command::Status => handle_status_command(bot, msg, ctx).await,
                        Command::Pause => handle_pause_command(bot, msg, ctx).await,
                        Command::Resume => handle_resume_command(bot, msg, ctx).await,
                        Command::Drain => handle_drain_command(bot, msg, ctx).await,
                        Command::Forcerun => handle_forcerun_command(bot, msg, ctx).await,
                    }
                },
            ),
    );

    // Create dispatcher
    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![ctx])
        .enable_ctrlc_handler()
        .build();

    log::info!("Bot is running. Press Ctrl+C to stop.");

    dispatcher.dispatch().await;

    Ok(())
}

/// Retry getting bot info with exponential backoff
async fn retry_get_me(bot: &Bot) -> Result<Me> {
    let max_retries = 5;
    let mut delay = Duration::from_secs(2);

    log::info!("Attempting to connect to Telegram API...");

    for attempt in 1..=max_retries {
        match bot.get_me().await {
            Ok(me) => {
                log::info!("Connected to Telegram API on attempt {}", attempt);
                return Ok(me);
            }
            Err(e) => {
                if attempt == max_retries {
                    anyhow::bail!(
                        "Failed to connect to Telegram API after {} attempts: {}",
                        max_retries,
                        e
                    );
                }

                log::warn!(
                    "Failed to connect to Telegram API (attempt {}/{}): {}. Retrying in {:?}...",
                    attempt,
                    max_retries,
                    e,
                    delay
                );

                sleep(delay).await;
                delay *= 2; // Exponential backoff
            }
        }
    }

    unreachable!()
}

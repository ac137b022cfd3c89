/// Scheduler module
///
/// Drives the job coordinator on a fixed interval and serializes every
/// trigger path (the tick, the /forcerun command, the HTTP endpoint) so at
/// most one run is ever in flight.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time;

use crate::job::{JobCoordinator, JobResult};

// Global guard: run_once assumes non-overlapping invocations, and a run can
// take longer than the interval that triggered it.
lazy_static::lazy_static! {
    static ref RUN_LOCK: Mutex<()> = Mutex::new(());
}

/// Execute one job run under the process-wide guard. Every caller that
/// wants a run goes through here.
pub async fn run_job(coordinator: &JobCoordinator) -> Result<JobResult> {
    let _guard = RUN_LOCK.lock().await;
    coordinator.run_once().await
}

/// Start the periodic posting scheduler.
pub async fn start_scheduler(
    coordinator: Arc<JobCoordinator>,
    interval_minutes: u64,
) -> Result<()> {
    let mut interval = time::interval(Duration::from_secs(interval_minutes * 60));

    log::info!(
        "Starting posting scheduler (interval: {} minutes)",
        interval_minutes
    );

    // Skip the first tick (immediate execution)
    interval.tick().await;

    loop {
        interval.tick().await;

        log::info!("Scheduled posting run triggered");

        match run_job(&coordinator).await {
            Ok(result) => {
                if result.canceled {
                    log::info!("Run ended early: scheduler is paused or was paused mid-run");
                } else {
                    log::info!(
                        "Run complete: {} posted, {:.0} bytes",
                        result.posted_count,
                        result.posted_bytes
                    );
                }
            }
            Err(e) => {
                log::error!("Posting run failed: {:#}", e);
            }
        }
    }
}

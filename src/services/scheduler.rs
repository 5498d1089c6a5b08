use std::time::Duration;

use chrono::{Datelike, Timelike, Utc};
use tokio::time::sleep;

use crate::state::AppState;

/// Spawn the background scheduler that runs the periodic billing jobs.
///
/// Each job runs in its own `tokio::spawn` so a failure in one job
/// never crashes the scheduler loop or other jobs. Every entry point it
/// calls is idempotent, so overlapping runs (or a restart mid-cycle)
/// are safe.
pub async fn run_background_scheduler(state: AppState) {
    tracing::info!("Background scheduler started");

    let pool = match state.db_pool.as_ref() {
        Some(p) => p.clone(),
        None => {
            tracing::warn!("Scheduler: no database pool configured, exiting");
            return;
        }
    };

    if !state.config.billing_enabled {
        tracing::info!("Scheduler: billing jobs are disabled");
        return;
    }

    let sweep_interval =
        Duration::from_secs(state.config.overdue_sweep_interval_hours.max(1) * 3600);
    let mut last_sweep_run: Option<tokio::time::Instant> = None;
    let mut last_daily_run: Option<(i32, u32)> = None;

    loop {
        sleep(Duration::from_secs(15)).await;

        let now_instant = tokio::time::Instant::now();
        let local_now = Utc::now().with_timezone(&state.config.billing_timezone);
        let today = local_now.date_naive();

        // --- Overdue sweep (every N hours) ---
        let sweep_due = last_sweep_run
            .map(|last| now_instant.duration_since(last) >= sweep_interval)
            .unwrap_or(true);
        if sweep_due {
            last_sweep_run = Some(now_instant);
            let pool = pool.clone();
            let config = state.config.clone();
            tokio::spawn(async move {
                let result =
                    crate::services::billing_cycle::run_overdue_sweep(&pool, &config).await;
                if result.swept_overdue > 0 || result.errors > 0 {
                    tracing::info!(
                        overdue = result.swept_overdue,
                        notices = result.notices_queued,
                        errors = result.errors,
                        "Scheduler: overdue sweep completed"
                    );
                }
            });
        }

        // --- Daily jobs (run once per local calendar day) ---
        let day_key = (today.year(), today.ordinal());
        if last_daily_run == Some(day_key) {
            continue;
        }
        if local_now.hour() < state.config.billing_daily_hour {
            continue;
        }
        last_daily_run = Some(day_key);
        tracing::info!("Scheduler: running daily billing jobs for {today}");

        // Daily billing cycle: generation plus sweep-with-notices.
        {
            let pool = pool.clone();
            let config = state.config.clone();
            tokio::spawn(async move {
                let result =
                    crate::services::billing_cycle::run_daily_billing_cycle(&pool, &config, None)
                        .await;
                tracing::info!(
                    generated = result.generated,
                    overdue = result.swept_overdue,
                    errors = result.errors,
                    "Scheduler: daily billing cycle completed"
                );
            });
        }

        // First of the month: an extra generation pass so the new
        // period exists early in the day regardless of daily timing.
        if today.day() == 1 {
            let pool = pool.clone();
            let config = state.config.clone();
            tokio::spawn(async move {
                match crate::services::billing_cycle::run_generation(&pool, &config, None).await {
                    Ok(run) => {
                        if run.created > 0 {
                            tracing::info!(
                                created = run.created,
                                "Scheduler: monthly generation completed"
                            );
                        }
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "Scheduler: monthly generation failed");
                    }
                }
            });
        }
    }
}

//! BidPilot - automated bid optimization control plane
//!
//! Wires the stores, data plane, coordinator, pacing controller,
//! effect tracker and scheduler together, then runs the control loops
//! until shutdown. All components are constructed here and injected;
//! there is no global state.

use bidpilot_backend::ads_api::RecordingAdsApi;
use bidpilot_backend::models::Config;
use bidpilot_backend::optimization::NoSignals;
use bidpilot_backend::service::App;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bidpilot=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        database = %config.database_path,
        workers = config.worker_count,
        "starting bid optimization control plane"
    );

    // The live platform client is wired by the deployment; the recording
    // client keeps every write local (dry run).
    let app = Arc::new(App::build(
        config.clone(),
        Arc::new(RecordingAdsApi::new()),
        Arc::new(NoSignals),
    )?);

    let scheduler = Arc::new(app.scheduler());
    let shutdown = scheduler.shutdown_token();

    // Scheduler loop: fires due tasks into the worker pool.
    let scheduler_handle = {
        let scheduler = scheduler.clone();
        let tick = Duration::from_secs(config.scheduler_tick_seconds);
        tokio::spawn(async move { scheduler.run(tick).await })
    };

    // Pacing loop: independent of the scheduler, never below the
    // 15-minute floor.
    let pacing_handle = {
        let app = app.clone();
        let shutdown = shutdown.clone();
        let mut ticker = interval(Duration::from_secs(config.pacing_interval_minutes * 60));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => return,
                }
                match app.entities.list_accounts() {
                    Ok(accounts) => {
                        for account in accounts {
                            if account.needs_reauth {
                                continue;
                            }
                            if let Err(e) = app.check_all_campaigns_pacing(account.id) {
                                error!(account_id = account.id, error = %e, "pacing pass failed");
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "failed to list accounts for pacing"),
                }
            }
        })
    };

    // Effect tracking loop: horizon passes, rule evaluation, retention
    // cleanup.
    let tracking_handle = {
        let app = app.clone();
        let shutdown = shutdown.clone();
        let mut ticker = interval(Duration::from_secs(
            config.effect_tracking_interval_minutes * 60,
        ));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => return,
                }
                for period in [7, 14, 30] {
                    if let Err(e) = app.run_effect_tracking_task(period) {
                        error!(period, error = %e, "effect tracking pass failed");
                    }
                }
                if let Err(e) = app.run_rollback_evaluation(None) {
                    error!(error = %e, "rollback evaluation failed");
                }
                if let Err(e) = app.rollback.cleanup() {
                    error!(error = %e, "suggestion cleanup failed");
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.cancel();

    let _ = tokio::join!(scheduler_handle, pacing_handle, tracking_handle);
    info!("control plane stopped");
    Ok(())
}

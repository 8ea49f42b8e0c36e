//! # Ad-Exchange Control Plane Server
//!
//! Keeps the searchable offer index fresh and owns the click pacing store:
//!
//! - a refresh loop that fetches every enabled channel, builds a new index
//!   and swaps it in every refresh period,
//! - a reaper that drops expired pacing buckets,
//! - a monitor that logs the live generation and store sizes.
//!
//! Configuration is layered: built-in defaults, then the JSON file given by
//! `--config-path` (or `server_adx.conf` when present), then environment
//! variables and command line flags.

use anyhow::Result;
use static_init::dynamic;
use tokio::signal;

mod adx_logic;
use adx_common::loggers::{cleanup_old_logs, init_tracing};
use adx_logic::{config, monitor, state};

const APP_NAME: &str = "server_adx";
const KEEP_LOG_FILES: usize = 14;

// load .env files before anything else
#[dynamic]
static DOTENV_INIT: () = {
    let dotenv_os: &str = if cfg!(target_os = "windows") {
        ".env.windows"
    } else {
        ".env.linux"
    };

    dotenvy::dotenv().ok();
    dotenvy::from_filename(dotenv_os).ok();
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config()?;
    let log_dir = config.log_dir();
    let _guard = init_tracing(APP_NAME, &log_dir, config.log_level())?;
    if let Err(e) = cleanup_old_logs(&log_dir, APP_NAME, KEEP_LOG_FILES) {
        tracing::warn!(error = %e, "Failed to clean up old log files");
    }

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let (app_state, scheduler) = state::AppState::build(&config).await?;

    let mut refresh_handle = tokio::spawn(scheduler.run());

    let pacing = app_state.pacing.clone();
    let reaper_handle = tokio::spawn(async move { pacing.run_reaper().await });

    let monitor_handle = tokio::spawn(monitor::run(
        config.clone(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));

    // Wait for a shutdown signal or the refresh loop dying
    let outcome = tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("Ctrl-C received, initiating shutdown.");
            Ok(())
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        tracing::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "SIGTERM handler unavailable");
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => Ok(()),
        joined = &mut refresh_handle => {
            match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("Refresh loop stopped")),
                Err(e) => Err(anyhow::Error::new(e).context("Refresh task panicked")),
            }
        }
    };

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());
    refresh_handle.abort();
    reaper_handle.abort();
    let _ = monitor_handle.await;

    tracing::info!(generation = app_state.registry.generation(), "Shutdown complete.");
    outcome
}

use crate::adx_logic::config::Config;
use crate::adx_logic::state::AppState;
use tokio::sync::broadcast;
use tokio::time::interval;

/// Logs the live index generation and pacing store size every
/// `monitorIntervalSeconds` until shutdown.
pub async fn run(config: Config, app_state: AppState, mut shutdown: broadcast::Receiver<()>) {
    let mut check_interval = interval(config.monitor_interval());
    let mut last_generation = app_state.registry.generation();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Monitor service received shutdown signal.");
                break;
            }
            _ = check_interval.tick() => {
                let snapshot = app_state.registry.current();
                let age_secs = (chrono::Utc::now() - snapshot.built_at()).num_seconds();
                tracing::info!(
                    generation = snapshot.generation(),
                    documents = snapshot.documents(),
                    index_age_secs = age_secs,
                    pacing_buckets = app_state.pacing.size(),
                    "Control plane status"
                );

                let stale_after = config.refresh_settings().period.as_secs() as i64 * 3;
                if snapshot.generation() == last_generation && snapshot.generation() > 0 && age_secs > stale_after {
                    tracing::warn!(
                        generation = snapshot.generation(),
                        index_age_secs = age_secs,
                        "Live index has not been replaced for three refresh periods"
                    );
                }
                last_generation = snapshot.generation();
            }
        }
    }
}

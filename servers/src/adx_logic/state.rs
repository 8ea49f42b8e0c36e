use crate::adx_logic::config::Config;
use adx_common::clock::{Clock, TokioClock};
use adx_common::core::RefreshScheduler;
use adx_common::index::{IndexEngine, IndexRegistry, MemoryEngine, MemoryIndex};
use adx_common::ingestors::{BlobChannelFetcher, ChannelFetcher, HttpStreamFetcher};
use adx_common::inventory::RecordPreprocessor;
use adx_common::pacing::{
    FleetSizeProvider, HttpFleetSizeProvider, PacingController, StaticFleetSize,
};
use adx_common::retrieve::ApiClient;
use adx_common::storage::{BlobStore, FilesystemBlobStore, S3BlobStore};
use anyhow::{Context, Result};
use std::sync::Arc;

/// Handles shared by the long-running tasks of the server.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<IndexRegistry<MemoryIndex>>,
    pub pacing: Arc<PacingController>,
}

impl AppState {
    /// Wires storage, fetchers, the registry and the pacing controller from
    /// `config`. The returned scheduler owns the refresh loop.
    pub async fn build(config: &Config) -> Result<(AppState, RefreshScheduler<MemoryEngine>)> {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);

        let store: Arc<dyn BlobStore> = if config.uses_s3() {
            let s3 = S3BlobStore::new(config.s3_config())
                .await
                .context("Failed to create the S3 blob store")?;
            tracing::info!(bucket = s3.bucket(), "Using S3 blob store");
            Arc::new(s3)
        } else {
            let root = config.storage_root();
            tracing::info!(root = %root.display(), "Using filesystem blob store");
            Arc::new(FilesystemBlobStore::new(root))
        };

        let http = ApiClient::new(None, None, config.http_timeout())
            .context("Failed to create the channel HTTP client")?;
        let fetcher = ChannelFetcher::new(
            HttpStreamFetcher::new(http),
            BlobChannelFetcher::new(store).with_max_decoded_bytes(config.max_object_bytes()),
        );

        let engine = MemoryEngine;
        let registry = Arc::new(IndexRegistry::new(engine.new_index(), clock.now()));
        let preprocessor = Arc::new(RecordPreprocessor::new(config.preprocess_settings()));

        let provider: Box<dyn FleetSizeProvider> = match &config.fleet_url {
            Some(url) => {
                let client = ApiClient::new(Some(url.as_str()), None, config.http_timeout())
                    .with_context(|| format!("Invalid fleet url {url:?}"))?;
                Box::new(HttpFleetSizeProvider::new(client))
            }
            // A lone server paces with the whole global target.
            None => Box::new(StaticFleetSize(1)),
        };
        let pacing = PacingController::from_fleet(
            provider.as_ref(),
            config.fleet_group(),
            config.pacing_settings(),
            clock.clone(),
        )
        .await;

        let scheduler = RefreshScheduler::new(
            engine,
            registry.clone(),
            fetcher,
            preprocessor,
            clock,
            config.refresh_settings(),
        );

        Ok((
            AppState {
                registry,
                pacing: Arc::new(pacing),
            },
            scheduler,
        ))
    }
}

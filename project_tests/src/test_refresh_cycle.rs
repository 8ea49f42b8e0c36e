//! # Refresh Cycle Smoke Test
//!
//! Runs exactly one refresh cycle against a local inventory directory laid
//! out like the bucket (`config/channel_status.json`, `offers/<channel>/<n>.gz`,
//! `tmp_test/offers/<channel>/...`) and prints the cycle report as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use adx_common::clock::{Clock, TokioClock};
use adx_common::core::{RefreshScheduler, RefreshSettings};
use adx_common::index::{IndexRegistry, MemoryEngine, MemoryIndex, SearchIndex};
use adx_common::ingestors::{BlobChannelFetcher, ChannelFetcher, HttpStreamFetcher};
use adx_common::inventory::{PreprocessSettings, RecordPreprocessor};
use adx_common::retrieve::{ApiClient, DEFAULT_TIMEOUT};
use adx_common::storage::FilesystemBlobStore;
use clap::Parser;
use serde_json::json;

#[derive(Parser, Debug)]
#[clap(about = "Run one refresh cycle against a local inventory directory")]
struct Args {
    /// Directory standing in for the bucket.
    #[clap(long)]
    root: PathBuf,

    /// Base key of the channel folders.
    #[clap(long, default_value = "offers")]
    base_key: String,

    /// Print the first N documents of the built index.
    #[clap(long, default_value_t = 5)]
    sample: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // // Statement: Wire the scheduler with the real clock and a filesystem bucket
    let clock: Arc<dyn Clock> = Arc::new(TokioClock);
    let store = Arc::new(FilesystemBlobStore::new(&args.root));
    let http = HttpStreamFetcher::new(ApiClient::new(None, None, DEFAULT_TIMEOUT)?);
    let registry = Arc::new(IndexRegistry::new(MemoryIndex::default(), clock.now()));
    let settings = RefreshSettings {
        base_key: args.base_key.clone(),
        ..RefreshSettings::default()
    };
    let mut scheduler = RefreshScheduler::new(
        MemoryEngine,
        registry.clone(),
        ChannelFetcher::new(http, BlobChannelFetcher::new(store)),
        Arc::new(RecordPreprocessor::new(PreprocessSettings::default())),
        clock,
        settings,
    );

    println!("[*] Running one refresh cycle over {}", args.root.display());

    match scheduler.run_cycle().await {
        Ok(report) => {
            // // Statement: Success - print the report and a sample of the index
            let snapshot = registry.current();
            let sample = snapshot.index().dump_by_page(0, args.sample);
            let output = json!({
                "generation": report.generation,
                "documents": report.documents,
                "statusRefreshed": report.status_refreshed,
                "enabledChannels": report.enabled_channels,
                "failedChannels": report.failed_channels,
                "channels": report.channels,
                "totals": report.totals(),
                "sample": sample.iter().map(|offer| offer.as_ref()).collect::<Vec<_>>(),
            });
            println!("\n[SUCCESS] Cycle complete:");
            println!("-----------------------------------------------");
            println!("{}", serde_json::to_string_pretty(&output)?);
            println!("-----------------------------------------------");
        }
        Err(e) => {
            eprintln!("\n[ERROR] Refresh cycle failed:");
            eprintln!(">>> {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

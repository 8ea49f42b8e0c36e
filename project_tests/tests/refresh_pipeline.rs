//! End-to-end refresh: a streaming HTTP channel, bucket channels (gzipped,
//! plain and corrupt objects), the offline composite-id channel and the
//! temporary test area, all built into one index and swapped in.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use adx_common::clock::{Clock, ManualClock};
use adx_common::core::{RefreshPhase, RefreshScheduler, RefreshSettings};
use adx_common::index::{Conditions, IndexRegistry, MemoryEngine, MemoryIndex, SearchIndex};
use adx_common::ingestors::{BlobChannelFetcher, ChannelFetcher, ChannelSource, HttpStreamFetcher};
use adx_common::inventory::{ChannelProfile, PreprocessSettings, RecordPreprocessor};
use adx_common::retrieve::{ApiClient, DEFAULT_TIMEOUT};
use adx_common::storage::FilesystemBlobStore;
use chrono::{TimeZone, Utc};
use project_tests::{MockChannel, ads_envelope, gzipped_offers, offer};
use serde_json::json;

const MALFORMED: &str = r#"{"id":"broken","payout":"lots"}"#;

fn put(root: &Path, key: &str, data: impl AsRef<[u8]>) {
    let path = root.join(key);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, data).unwrap();
}

fn seed_bucket(root: &Path) {
    put(
        root,
        "config/channel_status.json",
        json!([
            {"channel": "mob", "type": ["cpi"]},
            {"channel": "zed", "type": ["cpi"]},
            {"channel": "offline", "type": []}
        ])
        .to_string(),
    );

    put(
        root,
        "offers/zed/1.gz",
        gzipped_offers(&[
            offer("z1", 2.0, "country in {US}"),
            offer("z2", 0.005, "country in {US}"),
        ]),
    );
    put(
        root,
        "offers/zed/2.json",
        json!([offer("z3", 1.0, "country in {IN}")]).to_string(),
    );
    put(root, "offers/zed/3.gz", b"definitely not gzip");
    put(root, "offers/zed/latest.gz", gzipped_offers(&[offer("stale", 9.0, "country in {US}")]));

    put(
        root,
        "offers/offline/1.gz",
        gzipped_offers(&[
            offer("mob_o1", 3.0, "country in {US} and os in {android}"),
            offer("noseparator", 3.0, "country in {US}"),
        ]),
    );

    // Present in the bucket but never named in the status document.
    put(root, "offers/dark/1.json", json!([offer("d1", 1.0, "country in {US}")]).to_string());
    put(root, "tmp_test/offers/zed/1.json", json!([offer("t9", 1.0, "country in {US}")]).to_string());
}

fn scheduler(
    root: &Path,
    mob_url: &str,
    clock: Arc<ManualClock>,
) -> RefreshScheduler<MemoryEngine> {
    let store = Arc::new(FilesystemBlobStore::new(root));
    let http = HttpStreamFetcher::new(ApiClient::new(None, None, DEFAULT_TIMEOUT).unwrap());
    let fetcher = ChannelFetcher::new(http, BlobChannelFetcher::new(store));
    let registry = Arc::new(IndexRegistry::new(MemoryIndex::default(), clock.now()));

    let mut channels = BTreeMap::new();
    channels.insert(
        "mob".to_string(),
        ChannelSource::Http {
            url: mob_url.to_string(),
        },
    );
    let settings = RefreshSettings {
        channels,
        ..RefreshSettings::default()
    };

    let mut profiles = BTreeMap::new();
    profiles.insert(
        "zed".to_string(),
        ChannelProfile {
            affiliate_tag: Some("aff_sub=adx".to_string()),
        },
    );
    let preprocessor = RecordPreprocessor::new(PreprocessSettings {
        profiles,
        ..PreprocessSettings::default()
    });

    RefreshScheduler::new(MemoryEngine, registry, fetcher, Arc::new(preprocessor), clock, settings)
}

fn us() -> Conditions {
    let mut conditions = Conditions::new();
    conditions.insert("country".to_string(), "US".to_string());
    conditions.insert("os".to_string(), "android".to_string());
    conditions
}

#[tokio::test]
async fn refresh_cycles_build_and_swap_the_live_index() {
    let bucket = tempfile::tempdir().unwrap();
    seed_bucket(bucket.path());

    let first = ads_envelope(
        "success",
        &[
            offer("m1", 1.2, "country in {US}").to_string(),
            MALFORMED.to_string(),
            offer("m3", 1.2, "").to_string(),
        ],
    );
    let mut second_ads = vec![offer("m4", 1.0, "country in {US}").to_string()];
    second_ads.extend(std::iter::repeat_n(MALFORMED.to_string(), 51));
    second_ads.push(offer("m5", 1.0, "country in {US}").to_string());
    let second = ads_envelope("partial", &second_ads);

    let server = MockChannel::serve(vec![first, second], 64);
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
    let mut scheduler = scheduler(bucket.path(), &server.url, clock.clone());

    // First cycle.
    let report = scheduler.run_cycle().await.unwrap();

    assert!(report.status_refreshed);
    assert_eq!(report.enabled_channels, vec!["mob", "offline", "zed"]);
    assert!(report.failed_channels.is_empty());
    assert_eq!(report.generation, 1);

    let mob = &report.channels["mob"];
    assert_eq!((mob.fetched, mob.inserted, mob.decode_failures, mob.missing_expression), (2, 1, 1, 1));
    assert!(!mob.abandoned);

    let zed = &report.channels["zed"];
    assert_eq!(zed.fetched, 3);
    assert_eq!(zed.inserted, 2);
    assert_eq!(zed.below_floor, 1);
    // The corrupt object is skipped and counted; latest.gz is not an inventory object.
    assert_eq!(zed.decode_failures, 1);

    let offline = &report.channels["offline"];
    assert_eq!(offline.inserted, 1);
    assert_eq!(offline.invalid_composite_id, 1);

    assert_eq!(report.channels["tmp_test/zed"].inserted, 1);
    assert!(!report.channels.contains_key("dark"));
    assert_eq!(report.documents, 5);

    let live = scheduler.registry().current();
    let index = live.index();
    let mut hits = index.search(&us(), &|_| true).unwrap();
    hits.sort();
    assert_eq!(hits, vec!["mob_m1", "mob_o1", "zed_t9", "zed_z1"]);
    assert!(index.get_attribute("zed_t9").unwrap().temporary);
    assert_eq!(
        index.get_attribute("zed_z1").unwrap().attachment_args,
        vec!["aff_sub=adx".to_string()]
    );
    assert!(index.get_attribute("zed_stale").is_err());
    assert!(index.get_attribute("dark_d1").is_err());

    // Second cycle, after the refresh period.
    let report = scheduler.run_cycle().await.unwrap();

    assert_eq!(clock.sleeps(), vec![Duration::from_secs(300)]);
    assert_eq!(report.generation, 2);
    let mob = &report.channels["mob"];
    assert!(mob.abandoned);
    assert_eq!(mob.inserted, 1);
    assert_eq!(mob.decode_failures, 51);
    assert!(report.failed_channels.is_empty());

    // The first snapshot stays readable while the new one is live.
    assert_eq!(live.generation(), 1);
    assert!(live.index().get_attribute("mob_m1").is_ok());
    let current = scheduler.registry().current();
    assert!(current.index().get_attribute("mob_m1").is_err());
    assert!(current.index().get_attribute("mob_m4").is_ok());
    assert!(current.index().get_attribute("mob_m5").is_err());
    assert_eq!(scheduler.phase(), RefreshPhase::Sleep);

    assert_eq!(server.join(), 2);
}

#[tokio::test]
async fn unreadable_status_document_keeps_previous_enablement() {
    let bucket = tempfile::tempdir().unwrap();
    seed_bucket(bucket.path());

    let body = ads_envelope("success", &[offer("m1", 1.2, "country in {US}").to_string()]);
    let server = MockChannel::serve(vec![body.clone(), body], 1024);
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
    let mut scheduler = scheduler(bucket.path(), &server.url, clock);

    let first = scheduler.run_cycle().await.unwrap();
    assert!(first.status_refreshed);

    put(bucket.path(), "config/channel_status.json", "{ broken");
    let second = scheduler.run_cycle().await.unwrap();

    assert!(!second.status_refreshed);
    assert_eq!(second.enabled_channels, first.enabled_channels);
    assert_eq!(second.documents, first.documents);
    assert_eq!(server.join(), 2);
}

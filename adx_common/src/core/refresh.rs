//! # Refresh Scheduler
//!
//! The background loop that keeps the offer index fresh. Each cycle walks a
//! fixed sequence of phases:
//!
//! ```text
//! FetchChannelStatus -> UpdateEnabledChannels -> IngestChannels
//!     -> IngestTemporary -> PublishIndex -> Sleep -> FetchChannelStatus ...
//! ```
//!
//! Source failures are logged and absorbed: a missing status document keeps
//! the previous enablement, and a failing channel only loses its own
//! contribution. Reaching a phase out of order is a bug and stops the loop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::index::{IndexBuilder, IndexEngine, IndexRegistry};
use crate::ingestors::{
    channel_prefix, fetch_channel_status, ChannelFetcher, ChannelSource, ChannelStatusBook,
    ChannelStatusEntry, FetchError, FetchSummary, DEFAULT_STATUS_KEY,
};
use crate::inventory::{IngestStats, RawOffer, RecordPreprocessor};

/// Nominal time between two cycles.
pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_secs(5 * 60);
/// Root of the bucket area holding test inventory.
pub const DEFAULT_TEMPORARY_PREFIX: &str = "tmp_test";
pub const DEFAULT_BASE_KEY: &str = "offers";

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshSettings {
    pub period: Duration,
    /// Blob key of the channel enablement document.
    pub status_key: String,
    /// Base key of blob channels: `<base_key>/<channel>/<n>.gz`.
    pub base_key: String,
    pub temporary_prefix: String,
    /// Ingest `<temporary_prefix>/<base_key>/<channel>/` folders each cycle.
    pub scan_temporary: bool,
    /// Sources of the channels that do not publish under `base_key`.
    pub channels: BTreeMap<String, ChannelSource>,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            period: DEFAULT_REFRESH_PERIOD,
            status_key: DEFAULT_STATUS_KEY.to_string(),
            base_key: DEFAULT_BASE_KEY.to_string(),
            temporary_prefix: DEFAULT_TEMPORARY_PREFIX.to_string(),
            scan_temporary: true,
            channels: BTreeMap::new(),
        }
    }
}

impl RefreshSettings {
    /// Where an enabled channel is read from. Channels without an explicit
    /// source are read from the bucket.
    pub fn source_for(&self, channel: &str) -> ChannelSource {
        self.channels
            .get(channel)
            .cloned()
            .unwrap_or(ChannelSource::Blob { base_key: None })
    }

    /// Base key of the temporary area, `<temporary_prefix>/<base_key>`.
    pub fn temporary_base(&self) -> String {
        format!(
            "{}/{}",
            self.temporary_prefix.trim_matches('/'),
            self.base_key.trim_matches('/')
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    FetchChannelStatus,
    UpdateEnabledChannels,
    IngestChannels,
    IngestTemporary,
    PublishIndex,
    Sleep,
}

impl RefreshPhase {
    /// The only phase allowed to follow `self`.
    pub fn next(self) -> Self {
        match self {
            RefreshPhase::FetchChannelStatus => RefreshPhase::UpdateEnabledChannels,
            RefreshPhase::UpdateEnabledChannels => RefreshPhase::IngestChannels,
            RefreshPhase::IngestChannels => RefreshPhase::IngestTemporary,
            RefreshPhase::IngestTemporary => RefreshPhase::PublishIndex,
            RefreshPhase::PublishIndex => RefreshPhase::Sleep,
            RefreshPhase::Sleep => RefreshPhase::FetchChannelStatus,
        }
    }
}

/// Unrecoverable scheduler faults. The loop stops on any of them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("invalid refresh transition {from:?} -> {to:?}")]
    InvalidTransition { from: RefreshPhase, to: RefreshPhase },

    #[error("refresh phase {phase:?} reached without {missing}")]
    BrokenCycle {
        phase: RefreshPhase,
        missing: &'static str,
    },
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// False when the status document could not be read and the previous
    /// enablement was reused.
    pub status_refreshed: bool,
    pub enabled_channels: Vec<String>,
    /// Counters per channel. Temporary folders are keyed `<prefix>/<channel>`.
    pub channels: BTreeMap<String, IngestStats>,
    /// Channels whose fetch ended in an error.
    pub failed_channels: Vec<String>,
    pub generation: u64,
    pub documents: usize,
}

impl CycleReport {
    fn begin(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            status_refreshed: false,
            enabled_channels: Vec::new(),
            channels: BTreeMap::new(),
            failed_channels: Vec::new(),
            generation: 0,
            documents: 0,
        }
    }

    /// Totals over every channel.
    pub fn totals(&self) -> IngestStats {
        let mut total = IngestStats::default();
        for stats in self.channels.values() {
            total.merge(stats);
        }
        total
    }
}

/// State carried from one phase to the next within a cycle.
struct Cycle<I> {
    builder: IndexBuilder<I>,
    pulled: Option<Vec<ChannelStatusEntry>>,
    report: CycleReport,
}

pub struct RefreshScheduler<E: IndexEngine> {
    engine: E,
    registry: Arc<IndexRegistry<E::Index>>,
    fetcher: ChannelFetcher,
    preprocessor: Arc<RecordPreprocessor>,
    clock: Arc<dyn Clock>,
    settings: RefreshSettings,
    status_book: ChannelStatusBook,
    phase: RefreshPhase,
    cycle: Option<Cycle<E::Index>>,
    last_report: Option<CycleReport>,
}

impl<E: IndexEngine> RefreshScheduler<E> {
    pub fn new(
        engine: E,
        registry: Arc<IndexRegistry<E::Index>>,
        fetcher: ChannelFetcher,
        preprocessor: Arc<RecordPreprocessor>,
        clock: Arc<dyn Clock>,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            engine,
            registry,
            fetcher,
            preprocessor,
            clock,
            settings,
            status_book: ChannelStatusBook::new(),
            phase: RefreshPhase::FetchChannelStatus,
            cycle: None,
            last_report: None,
        }
    }

    pub fn phase(&self) -> RefreshPhase {
        self.phase
    }

    pub fn registry(&self) -> &Arc<IndexRegistry<E::Index>> {
        &self.registry
    }

    pub fn status_book(&self) -> &ChannelStatusBook {
        &self.status_book
    }

    /// Explicit channel toggle; the only way to disable a channel that a
    /// previous pull enabled.
    pub fn set_channel_enabled(&mut self, channel: &str, enabled: bool) {
        self.status_book.set(channel, enabled);
    }

    pub fn last_report(&self) -> Option<&CycleReport> {
        self.last_report.as_ref()
    }

    /// Runs forever. Only returns when the state machine breaks.
    ///
    /// # Errors
    ///
    /// Any [`RefreshError`].
    pub async fn run(mut self) -> Result<(), RefreshError> {
        info!(
            period_secs = self.settings.period.as_secs(),
            channels = self.settings.channels.len(),
            "Refresh loop started"
        );
        loop {
            if let Err(e) = self.run_cycle().await {
                error!(error = %e, phase = ?self.phase, "Refresh loop aborted");
                return Err(e);
            }
        }
    }

    /// Steps until one index has been published and returns its report. When
    /// called between cycles the pending sleep happens first.
    ///
    /// # Errors
    ///
    /// Any [`RefreshError`].
    pub async fn run_cycle(&mut self) -> Result<CycleReport, RefreshError> {
        loop {
            let published = self.phase == RefreshPhase::PublishIndex;
            self.step().await?;
            if published {
                return self.last_report.clone().ok_or(RefreshError::BrokenCycle {
                    phase: RefreshPhase::PublishIndex,
                    missing: "a cycle report",
                });
            }
        }
    }

    /// Executes the current phase and moves to the next one.
    ///
    /// # Errors
    ///
    /// Any [`RefreshError`].
    pub async fn step(&mut self) -> Result<(), RefreshError> {
        let phase = self.phase;
        match phase {
            RefreshPhase::FetchChannelStatus => self.fetch_channel_status().await?,
            RefreshPhase::UpdateEnabledChannels => self.update_enabled_channels()?,
            RefreshPhase::IngestChannels => self.ingest_channels().await?,
            RefreshPhase::IngestTemporary => self.ingest_temporary().await?,
            RefreshPhase::PublishIndex => self.publish_index()?,
            RefreshPhase::Sleep => self.clock.sleep(self.settings.period).await,
        }
        self.transition(phase.next())
    }

    fn transition(&mut self, to: RefreshPhase) -> Result<(), RefreshError> {
        if self.phase.next() != to {
            return Err(RefreshError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        debug!(from = ?self.phase, to = ?to, "Refresh phase transition");
        self.phase = to;
        Ok(())
    }

    fn cycle_mut(&mut self) -> Result<&mut Cycle<E::Index>, RefreshError> {
        let phase = self.phase;
        self.cycle.as_mut().ok_or(RefreshError::BrokenCycle {
            phase,
            missing: "an open cycle",
        })
    }

    async fn fetch_channel_status(&mut self) -> Result<(), RefreshError> {
        if self.cycle.is_some() {
            return Err(RefreshError::BrokenCycle {
                phase: self.phase,
                missing: "a closed previous cycle",
            });
        }

        let store = Arc::clone(self.fetcher.blob().store());
        let pulled = match fetch_channel_status(store.as_ref(), &self.settings.status_key).await {
            Ok(entries) => Some(entries),
            Err(e) => {
                warn!(
                    key = %self.settings.status_key,
                    error = %e,
                    "Channel status unavailable; reusing previous enablement"
                );
                None
            }
        };

        let builder = IndexBuilder::new(self.engine.new_index(), Arc::clone(&self.preprocessor));
        self.cycle = Some(Cycle {
            builder,
            pulled,
            report: CycleReport::begin(self.clock.now()),
        });
        Ok(())
    }

    fn update_enabled_channels(&mut self) -> Result<(), RefreshError> {
        let cycle = self.cycle.as_mut().ok_or(RefreshError::BrokenCycle {
            phase: self.phase,
            missing: "an open cycle",
        })?;

        if let Some(entries) = cycle.pulled.take() {
            let newly_enabled = self.status_book.apply_pull(&entries);
            cycle.report.status_refreshed = true;
            if newly_enabled > 0 {
                info!(newly_enabled, "Channels enabled by status pull");
            }
        }
        cycle.report.enabled_channels = self.status_book.enabled_channels();
        Ok(())
    }

    async fn ingest_channels(&mut self) -> Result<(), RefreshError> {
        let Self {
            fetcher,
            settings,
            cycle,
            phase,
            ..
        } = self;
        let cycle = cycle.as_mut().ok_or(RefreshError::BrokenCycle {
            phase: *phase,
            missing: "an open cycle",
        })?;

        for channel in cycle.report.enabled_channels.clone() {
            let source = settings.source_for(&channel);
            let mut stats = IngestStats::default();
            let result = {
                let builder = &mut cycle.builder;
                let mut sink = |raw: RawOffer| builder.ingest(&channel, raw, false, &mut stats);
                fetcher
                    .fetch(&channel, &source, &settings.base_key, &mut sink)
                    .await
            };
            settle(&channel, &mut stats, result, &mut cycle.report);
            cycle.report.channels.insert(channel, stats);
        }
        Ok(())
    }

    async fn ingest_temporary(&mut self) -> Result<(), RefreshError> {
        if !self.settings.scan_temporary {
            return self.cycle_mut().map(|_| ());
        }

        let Self {
            fetcher,
            settings,
            cycle,
            phase,
            ..
        } = self;
        let cycle = cycle.as_mut().ok_or(RefreshError::BrokenCycle {
            phase: *phase,
            missing: "an open cycle",
        })?;

        let base = settings.temporary_base();
        let blob = fetcher.blob();
        let channels = match blob.channels_under(&format!("{base}/")).await {
            Ok(channels) => channels,
            Err(e) => {
                warn!(prefix = %base, error = %e, "Temporary area unavailable; skipping");
                return Ok(());
            }
        };

        for channel in channels {
            let key = format!("{}/{}", settings.temporary_prefix.trim_matches('/'), channel);
            let prefix = channel_prefix(&base, &channel);
            let mut stats = IngestStats::default();
            let result = {
                let builder = &mut cycle.builder;
                let mut sink = |raw: RawOffer| builder.ingest(&channel, raw, true, &mut stats);
                blob.fetch_prefix(&channel, &prefix, &mut sink).await
            };
            settle(&key, &mut stats, result, &mut cycle.report);
            cycle.report.channels.insert(key, stats);
        }
        Ok(())
    }

    fn publish_index(&mut self) -> Result<(), RefreshError> {
        let Cycle {
            builder,
            mut report,
            ..
        } = self.cycle.take().ok_or(RefreshError::BrokenCycle {
            phase: self.phase,
            missing: "an open cycle",
        })?;

        let built_at = self.clock.now();
        let index = builder.finish();
        self.registry.publish(index, built_at, report.channels.clone());
        let snapshot = self.registry.current();

        report.finished_at = built_at;
        report.generation = snapshot.generation();
        report.documents = snapshot.documents();

        let totals = report.totals();
        info!(
            generation = report.generation,
            documents = report.documents,
            enabled_channels = report.enabled_channels.len(),
            failed_channels = report.failed_channels.len(),
            status_refreshed = report.status_refreshed,
            fetched = totals.fetched,
            discarded = totals.discarded(),
            insert_failures = totals.insert_failures,
            "Refresh cycle complete"
        );
        self.last_report = Some(report);
        Ok(())
    }
}

/// Folds a fetch outcome into the channel's counters and the cycle report.
fn settle(
    name: &str,
    stats: &mut IngestStats,
    result: Result<FetchSummary, FetchError>,
    report: &mut CycleReport,
) {
    match result {
        Ok(summary) => {
            stats.decode_failures += summary.decode_failures + summary.failed_objects;
            stats.abandoned = summary.abandoned;
        }
        Err(e) => {
            warn!(channel = name, error = %e, inserted = stats.inserted, "Channel fetch failed");
            report.failed_channels.push(name.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::index::{MemoryEngine, MemoryIndex, SearchIndex};
    use crate::ingestors::{BlobChannelFetcher, HttpStreamFetcher};
    use crate::inventory::PreprocessSettings;
    use crate::retrieve::{ApiClient, DEFAULT_TIMEOUT};
    use crate::storage::MemoryBlobStore;
    use chrono::TimeZone;

    fn offers(ids: &[&str]) -> String {
        let items: Vec<String> = ids
            .iter()
            .map(|id| format!(r#"{{"id":"{id}","payout":1.5,"expression":"country in {{US}}"}}"#))
            .collect();
        format!("[{}]", items.join(","))
    }

    struct Harness {
        store: Arc<MemoryBlobStore>,
        clock: Arc<ManualClock>,
        scheduler: RefreshScheduler<MemoryEngine>,
    }

    fn harness(channels: BTreeMap<String, ChannelSource>) -> Harness {
        let store = Arc::new(MemoryBlobStore::new());
        store.insert(
            DEFAULT_STATUS_KEY,
            r#"[{"channel":"mob","type":["cpi"]},{"channel":"zed","type":[]}]"#,
        );
        store.insert("offers/mob/1.json", offers(&["m1", "m2"]));
        store.insert("offers/zed/1.json", offers(&["z1"]));
        store.insert("offers/off/1.json", offers(&["never"]));
        store.insert("tmp_test/offers/mob/1.json", offers(&["m1"]));

        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
        let registry = Arc::new(IndexRegistry::new(MemoryIndex::default(), clock.now()));
        let http = HttpStreamFetcher::new(ApiClient::new(None, None, DEFAULT_TIMEOUT).unwrap());
        let fetcher = ChannelFetcher::new(http, BlobChannelFetcher::new(store.clone()));
        let settings = RefreshSettings {
            channels,
            ..RefreshSettings::default()
        };
        let scheduler = RefreshScheduler::new(
            MemoryEngine,
            registry,
            fetcher,
            Arc::new(RecordPreprocessor::new(PreprocessSettings::default())),
            clock.clone(),
            settings,
        );
        Harness {
            store,
            clock,
            scheduler,
        }
    }

    #[tokio::test]
    async fn one_cycle_builds_and_publishes_enabled_and_temporary_channels() {
        let mut h = harness(BTreeMap::new());

        let report = h.scheduler.run_cycle().await.unwrap();

        assert!(report.status_refreshed);
        assert_eq!(report.enabled_channels, vec!["mob", "zed"]);
        assert_eq!(report.generation, 1);
        assert_eq!(report.documents, 3);
        assert_eq!(report.channels["mob"].inserted, 2);
        assert_eq!(report.channels["zed"].inserted, 1);
        // The temporary copy of m1 collides with the permanent document.
        assert_eq!(report.channels["tmp_test/mob"].inserted, 0);
        assert_eq!(report.channels["tmp_test/mob"].insert_failures, 1);
        assert!(report.failed_channels.is_empty());
        assert_eq!(h.scheduler.phase(), RefreshPhase::Sleep);

        let snapshot = h.scheduler.registry().current();
        assert!(snapshot.index().get_attribute("mob_never").is_err());
        assert!(!snapshot.index().get_attribute("mob_m1").unwrap().temporary);
        assert!(h.clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn second_cycle_sleeps_one_period_first() {
        let mut h = harness(BTreeMap::new());
        h.scheduler.run_cycle().await.unwrap();
        let report = h.scheduler.run_cycle().await.unwrap();

        assert_eq!(report.generation, 2);
        assert_eq!(h.clock.sleeps(), vec![DEFAULT_REFRESH_PERIOD]);
        assert_eq!(
            report.started_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 5, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn status_failure_and_absence_keep_previous_enablement() {
        let mut h = harness(BTreeMap::new());
        h.scheduler.run_cycle().await.unwrap();

        h.store.insert(DEFAULT_STATUS_KEY, r#"[{"channel":"zed"}]"#);
        let report = h.scheduler.run_cycle().await.unwrap();
        assert!(report.status_refreshed);
        assert_eq!(report.enabled_channels, vec!["mob", "zed"]);

        h.store.fail_key(DEFAULT_STATUS_KEY);
        let report = h.scheduler.run_cycle().await.unwrap();
        assert!(!report.status_refreshed);
        assert_eq!(report.enabled_channels, vec!["mob", "zed"]);
        assert_eq!(report.documents, 3);

        h.scheduler.set_channel_enabled("mob", false);
        let report = h.scheduler.run_cycle().await.unwrap();
        assert_eq!(report.enabled_channels, vec!["zed"]);
        assert_eq!(report.documents, 2);
    }

    #[tokio::test]
    async fn failing_channel_does_not_block_the_others() {
        let mut channels = BTreeMap::new();
        channels.insert(
            "mob".to_string(),
            ChannelSource::Http {
                url: "not a url".to_string(),
            },
        );
        let mut h = harness(channels);

        let report = h.scheduler.run_cycle().await.unwrap();

        assert_eq!(report.failed_channels, vec!["mob"]);
        assert_eq!(report.channels["zed"].inserted, 1);
        // The temporary copy of mob now owns the document id.
        assert_eq!(report.channels["tmp_test/mob"].inserted, 1);
        let snapshot = h.scheduler.registry().current();
        assert!(snapshot.index().get_attribute("mob_m1").unwrap().temporary);
        assert_eq!(snapshot.documents(), 2);
    }

    #[tokio::test]
    async fn out_of_order_transition_is_fatal() {
        let mut h = harness(BTreeMap::new());
        assert_eq!(
            h.scheduler.transition(RefreshPhase::PublishIndex),
            Err(RefreshError::InvalidTransition {
                from: RefreshPhase::FetchChannelStatus,
                to: RefreshPhase::PublishIndex,
            })
        );

        h.scheduler.phase = RefreshPhase::PublishIndex;
        assert!(matches!(
            h.scheduler.step().await,
            Err(RefreshError::BrokenCycle { .. })
        ));
    }
}

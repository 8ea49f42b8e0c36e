//! # Pacing Controller
//!
//! Caps how often one offer may be served. Clicks are counted in per-offer
//! buckets of one calendar minute, keyed `"<offer id>_<minute of hour>"`, each
//! living two minutes after its last write. An offer is over its cap once its
//! bucket total exceeds the per-instance threshold.
//!
//! The threshold is the global target rate divided by the size of the serving
//! fleet, fixed when the controller is built. When the fleet size cannot be
//! learned the controller falls back to static defaults instead of failing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::expiring::ExpiringMap;
use super::fleet::FleetSizeProvider;
use crate::clock::Clock;

pub const DEFAULT_BUCKET_TTL: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_INSTANCE_COUNT: u64 = 10;
pub const DEFAULT_GLOBAL_TARGET: u64 = 200;
pub const DEFAULT_HIGH_VOLUME_COUNTRY: &str = "IN";
pub const DEFAULT_COUNTRY_MULTIPLIER: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingSettings {
    /// Clicks per offer per minute across the whole fleet.
    pub global_target: u64,
    /// Used with `fallback_global_target` when the fleet size is unknown.
    pub fallback_instance_count: u64,
    pub fallback_global_target: u64,
    /// Country whose cap is multiplied by `country_multiplier`.
    pub high_volume_country: String,
    pub country_multiplier: u64,
    #[serde(skip)]
    pub bucket_ttl: Duration,
    #[serde(skip)]
    pub reap_interval: Duration,
}

impl Default for PacingSettings {
    fn default() -> Self {
        Self {
            global_target: DEFAULT_GLOBAL_TARGET,
            fallback_instance_count: DEFAULT_INSTANCE_COUNT,
            fallback_global_target: DEFAULT_GLOBAL_TARGET,
            high_volume_country: DEFAULT_HIGH_VOLUME_COUNTRY.to_string(),
            country_multiplier: DEFAULT_COUNTRY_MULTIPLIER,
            bucket_ttl: DEFAULT_BUCKET_TTL,
            reap_interval: DEFAULT_REAP_INTERVAL,
        }
    }
}

/// The fleet-wide target and the fleet size it is split across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PacingThreshold {
    pub global_target: u64,
    pub instance_count: u64,
    /// False when the static fallback was used.
    pub derived_from_fleet: bool,
}

impl PacingThreshold {
    /// A threshold of exactly `per_instance` on a single instance.
    pub fn fixed(per_instance: u64) -> Self {
        Self {
            global_target: per_instance,
            instance_count: 1,
            derived_from_fleet: false,
        }
    }

    fn instances(&self) -> u64 {
        self.instance_count.max(1)
    }

    /// Share of the global target owed to one instance, rounded down.
    pub fn per_instance(&self) -> u64 {
        self.global_target / self.instances()
    }

    /// Share of a manual fleet-wide cap owed to one instance, rounded down.
    pub fn split(&self, fleet_cap: u64) -> u64 {
        fleet_cap / self.instances()
    }
}

/// Per-call cap override from the offer's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapOverride {
    #[default]
    UseDefault,
    /// Fleet-wide cap, split across instances like the global target.
    Manual(u64),
}

impl CapOverride {
    /// Sentinel used by offer configuration for "no override".
    pub const USE_DEFAULT_SENTINEL: i64 = -1;

    /// Maps the raw configuration value. `-1`, and any other negative value,
    /// means no override.
    pub fn from_raw(raw: i64) -> Self {
        u64::try_from(raw).map_or(CapOverride::UseDefault, CapOverride::Manual)
    }
}

/// Pacing bucket key, `"<offer id>_<minute>"`. Minutes wrap into `0..60`,
/// so a caller's minute counter can never open more than 60 buckets.
pub fn bucket_key(offer_id: &str, minute: u32) -> String {
    format!("{offer_id}_{}", minute % 60)
}

pub struct PacingController {
    buckets: ExpiringMap<u64>,
    threshold: PacingThreshold,
    settings: PacingSettings,
    clock: Arc<dyn Clock>,
}

impl PacingController {
    pub fn new(threshold: PacingThreshold, settings: PacingSettings, clock: Arc<dyn Clock>) -> Self {
        info!(
            global_target = threshold.global_target,
            instance_count = threshold.instance_count,
            per_instance = threshold.per_instance(),
            derived_from_fleet = threshold.derived_from_fleet,
            "Pacing threshold set"
        );
        Self {
            buckets: ExpiringMap::new(settings.bucket_ttl),
            threshold,
            settings,
            clock,
        }
    }

    /// Builds the controller from the live size of `group`. Never fails: an
    /// unreachable provider, an empty group or an ambiguous answer all fall
    /// back to the configured defaults.
    pub async fn from_fleet(
        provider: &dyn FleetSizeProvider,
        group: &str,
        settings: PacingSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let threshold = match provider.describe_group(group).await {
            Ok(instances) if instances > 0 => PacingThreshold {
                global_target: settings.global_target,
                instance_count: instances,
                derived_from_fleet: true,
            },
            outcome => {
                let reason = match outcome {
                    Err(e) => e.to_string(),
                    Ok(_) => "group reported no instances".to_string(),
                };
                warn!(group, %reason, "Fleet size unavailable; using fallback pacing threshold");
                PacingThreshold {
                    global_target: settings.fallback_global_target,
                    instance_count: settings.fallback_instance_count,
                    derived_from_fleet: false,
                }
            }
        };
        Self::new(threshold, settings, clock)
    }

    pub fn threshold(&self) -> PacingThreshold {
        self.threshold
    }

    /// Minute of the hour on the controller's clock.
    pub fn current_minute(&self) -> u32 {
        self.clock.now().minute()
    }

    /// Adds `count` clicks to the `(offer_id, minute)` bucket and returns the
    /// new total. A missing or expired bucket starts from zero.
    pub fn record_click(&self, offer_id: &str, minute: u32, count: u64) -> u64 {
        let key = bucket_key(offer_id, minute);
        self.buckets
            .update(&key, self.clock.now(), |current| {
                current.copied().unwrap_or(0).saturating_add(count)
            })
    }

    /// Current total of a bucket, zero when absent or expired.
    pub fn bucket_total(&self, offer_id: &str, minute: u32) -> u64 {
        self.buckets
            .get(&bucket_key(offer_id, minute), self.clock.now())
            .unwrap_or(0)
    }

    /// Cap that applies to one call.
    pub fn effective_threshold(&self, country: &str, cap: CapOverride) -> u64 {
        match cap {
            CapOverride::Manual(fleet_cap) => self.threshold.split(fleet_cap),
            CapOverride::UseDefault => {
                let base = self.threshold.per_instance();
                if country.eq_ignore_ascii_case(&self.settings.high_volume_country) {
                    base.saturating_mul(self.settings.country_multiplier)
                } else {
                    base
                }
            }
        }
    }

    /// True when the offer's bucket for `minute` is above its cap.
    pub fn is_over_cap(&self, offer_id: &str, country: &str, cap: CapOverride, minute: u32) -> bool {
        let total = self.bucket_total(offer_id, minute);
        let threshold = self.effective_threshold(country, cap);
        let over = total > threshold;
        if over {
            debug!(offer_id, country, total, threshold, "Offer over pacing cap");
        }
        over
    }

    /// Live buckets.
    pub fn size(&self) -> usize {
        self.buckets.len_live(self.clock.now())
    }

    /// Drops expired buckets and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        self.buckets.purge_expired(self.clock.now())
    }

    /// Purges expired buckets every `reap_interval`, forever.
    pub async fn run_reaper(&self) {
        loop {
            self.clock.sleep(self.settings.reap_interval).await;
            let purged = self.purge_expired();
            if purged > 0 {
                debug!(purged, live = self.size(), "Reaped pacing buckets");
            }
        }
    }

    #[cfg(test)]
    fn stored(&self) -> usize {
        self.buckets.len_stored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::pacing::fleet::{FleetError, StaticFleetSize};
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 5, 0).unwrap()))
    }

    fn controller(per_instance: u64, clock: &Arc<ManualClock>) -> PacingController {
        PacingController::new(
            PacingThreshold::fixed(per_instance),
            PacingSettings::default(),
            clock.clone(),
        )
    }

    #[test]
    fn minutes_outside_the_hour_wrap_onto_its_buckets() {
        let clock = clock();
        let pacing = controller(2, &clock);

        assert_eq!(bucket_key("o1", 65), "o1_5");
        assert_eq!(bucket_key("o1", 59), "o1_59");
        assert_eq!(pacing.record_click("o1", 5, 1), 1);
        assert_eq!(pacing.record_click("o1", 65, 1), 2);
        assert_eq!(pacing.record_click("o1", u32::MAX, 1), 1);

        assert_eq!(pacing.bucket_total("o1", 125), 2);
        assert!(!pacing.is_over_cap("o1", "US", CapOverride::UseDefault, 65));
        pacing.record_click("o1", 5, 1);
        assert!(pacing.is_over_cap("o1", "US", CapOverride::UseDefault, 65));
        assert_eq!(pacing.size(), 2);
    }

    #[test]
    fn three_clicks_cross_a_threshold_of_two_until_the_bucket_expires() {
        let clock = clock();
        let pacing = controller(2, &clock);
        let no_override = CapOverride::from_raw(-1);

        pacing.record_click("x", 5, 1);
        assert!(!pacing.is_over_cap("x", "US", no_override, 5));
        pacing.record_click("x", 5, 1);
        assert!(!pacing.is_over_cap("x", "US", no_override, 5));
        pacing.record_click("x", 5, 1);
        assert!(pacing.is_over_cap("x", "US", no_override, 5));
        assert_eq!(pacing.size(), 1);

        clock.advance(DEFAULT_BUCKET_TTL);
        assert!(!pacing.is_over_cap("x", "US", no_override, 5));
        assert_eq!(pacing.size(), 0);
    }

    #[test]
    fn totals_accumulate_and_stay_over_cap_within_the_minute() {
        let clock = clock();
        let pacing = controller(5, &clock);

        let mut expected = 0;
        let mut was_over = false;
        for count in [1, 3, 0, 2, 4] {
            expected += count;
            assert_eq!(pacing.record_click("o", 5, count), expected);
            clock.advance(Duration::from_secs(10));
            let over = pacing.is_over_cap("o", "BR", CapOverride::UseDefault, 5);
            assert!(over || !was_over);
            was_over = over;
        }
        assert_eq!(pacing.bucket_total("o", 5), 10);
        assert!(was_over);
        assert_eq!(pacing.bucket_total("o", 6), 0);
    }

    #[test]
    fn designated_country_doubles_the_default_cap_only() {
        let clock = clock();
        let pacing = controller(3, &clock);
        pacing.record_click("o", 5, 5);

        assert_eq!(pacing.effective_threshold("US", CapOverride::UseDefault), 3);
        assert_eq!(pacing.effective_threshold("in", CapOverride::UseDefault), 6);
        assert!(pacing.is_over_cap("o", "US", CapOverride::UseDefault, 5));
        assert!(!pacing.is_over_cap("o", "IN", CapOverride::UseDefault, 5));
        assert_eq!(pacing.effective_threshold("IN", CapOverride::Manual(4)), 4);
    }

    #[test]
    fn manual_override_is_split_across_instances() {
        let clock = clock();
        let threshold = PacingThreshold {
            global_target: 1000,
            instance_count: 4,
            derived_from_fleet: true,
        };
        let pacing = PacingController::new(threshold, PacingSettings::default(), clock.clone());

        assert_eq!(pacing.effective_threshold("US", CapOverride::UseDefault), 250);
        assert_eq!(pacing.effective_threshold("US", CapOverride::from_raw(40)), 10);
        assert_eq!(CapOverride::from_raw(-7), CapOverride::UseDefault);

        pacing.record_click("o", 5, 11);
        assert!(pacing.is_over_cap("o", "US", CapOverride::Manual(40), 5));
        assert!(!pacing.is_over_cap("o", "US", CapOverride::UseDefault, 5));
    }

    #[test]
    fn purge_reclaims_expired_buckets() {
        let clock = clock();
        let pacing = controller(2, &clock);
        pacing.record_click("a", 5, 1);
        clock.advance(Duration::from_secs(90));
        pacing.record_click("b", 6, 1);
        clock.advance(Duration::from_secs(30));

        assert_eq!(pacing.size(), 1);
        assert_eq!(pacing.stored(), 2);
        assert_eq!(pacing.purge_expired(), 1);
        assert_eq!(pacing.stored(), 1);
    }

    #[test]
    fn concurrent_clicks_are_never_lost() {
        let clock = clock();
        let pacing = controller(1_000_000, &clock);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..500 {
                        pacing.record_click("hot", 5, 1);
                    }
                });
            }
        });
        assert_eq!(pacing.bucket_total("hot", 5), 4000);
    }

    struct Unreachable;

    #[async_trait]
    impl FleetSizeProvider for Unreachable {
        async fn describe_group(&self, _name: &str) -> Result<u64, FleetError> {
            Err(FleetError::Unreachable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn from_fleet_derives_or_falls_back() {
        let settings = PacingSettings {
            global_target: 120,
            fallback_instance_count: 10,
            fallback_global_target: 50,
            ..PacingSettings::default()
        };

        let live = PacingController::from_fleet(&StaticFleetSize(6), "bidder", settings.clone(), clock()).await;
        assert_eq!(live.threshold().per_instance(), 20);
        assert!(live.threshold().derived_from_fleet);

        let down = PacingController::from_fleet(&Unreachable, "bidder", settings.clone(), clock()).await;
        assert_eq!(down.threshold().instance_count, 10);
        assert_eq!(down.threshold().per_instance(), 5);
        assert!(!down.threshold().derived_from_fleet);

        let empty = PacingController::from_fleet(&StaticFleetSize(0), "bidder", settings, clock()).await;
        assert_eq!(empty.threshold().per_instance(), 5);
    }

    #[tokio::test]
    async fn reaper_purges_on_its_interval() {
        let clock = clock();
        let pacing = Arc::new(controller(2, &clock));
        pacing.record_click("a", 5, 1);
        clock.advance(DEFAULT_BUCKET_TTL);

        let reaper = {
            let pacing = Arc::clone(&pacing);
            tokio::spawn(async move { pacing.run_reaper().await })
        };
        while pacing.stored() > 0 {
            tokio::task::yield_now().await;
        }
        reaper.abort();
        assert!(clock.sleeps().contains(&DEFAULT_REAP_INTERVAL));
    }
}

use adx_common::core::RefreshSettings;
use adx_common::ingestors::{ChannelSource, DEFAULT_MAX_DECODED_BYTES};
use adx_common::inventory::{ChannelProfile, PreprocessSettings};
use adx_common::pacing::PacingSettings;
use adx_common::storage::S3Config;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "server_adx.conf";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Ad-exchange control plane: inventory refresh and pacing", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "ADX_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "ADX_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "ADX_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "ADX_STORAGE", help = "Blob store backend: 'fs' or 's3'.")]
    pub storage: Option<String>,

    #[clap(long, env = "ADX_STORAGE_ROOT", help = "Root directory of the 'fs' blob store.")]
    pub storage_root: Option<PathBuf>,

    #[clap(long, env = "ADX_S3_BUCKET", help = "Bucket of the 's3' blob store.")]
    pub s3_bucket: Option<String>,

    #[clap(long, env = "ADX_S3_REGION", help = "Region of the 's3' blob store.")]
    pub s3_region: Option<String>,

    #[clap(long, env = "ADX_S3_ENDPOINT", help = "Custom endpoint for S3-compatible services.")]
    pub s3_endpoint: Option<String>,

    #[clap(long, env = "ADX_S3_FORCE_PATH_STYLE", help = "Use path-style S3 addressing.")]
    pub s3_force_path_style: Option<bool>,

    #[clap(long, env = "ADX_BASE_KEY", help = "Base key of channel inventory objects.")]
    pub base_key: Option<String>,

    #[clap(long, env = "ADX_STATUS_KEY", help = "Blob key of the channel enablement document.")]
    pub status_key: Option<String>,

    #[clap(long, env = "ADX_TEMPORARY_PREFIX", help = "Prefix of the temporary test inventory area.")]
    pub temporary_prefix: Option<String>,

    #[clap(long, env = "ADX_SCAN_TEMPORARY", help = "Ingest the temporary test inventory area.")]
    pub scan_temporary: Option<bool>,

    #[clap(long, env = "ADX_REFRESH_PERIOD_SECONDS", help = "Seconds between two index refresh cycles.")]
    pub refresh_period_seconds: Option<u64>,

    #[clap(long, env = "ADX_HTTP_TIMEOUT_SECONDS", help = "Timeout in seconds of one upstream HTTP request.")]
    pub http_timeout_seconds: Option<u64>,

    #[clap(long, env = "ADX_MAX_OBJECT_BYTES", help = "Decoded size above which a bucket inventory object is skipped.")]
    pub max_object_bytes: Option<u64>,

    #[clap(long, env = "ADX_PAYOUT_FLOOR", help = "Offers paying at or below this are discarded.")]
    pub payout_floor: Option<f64>,

    #[clap(long, env = "ADX_OFFLINE_CHANNEL", help = "Channel whose offers carry '<channel>_<id>' ids.")]
    pub offline_channel: Option<String>,

    #[clap(long, env = "ADX_FLEET_URL", help = "Base URL of the fleet inventory service.")]
    pub fleet_url: Option<String>,

    #[clap(long, env = "ADX_FLEET_GROUP", help = "Autoscaling group this server runs in.")]
    pub fleet_group: Option<String>,

    #[clap(long, env = "ADX_PACING_GLOBAL_TARGET", help = "Clicks per offer per minute across the fleet.")]
    pub pacing_global_target: Option<u64>,

    #[clap(long, env = "ADX_PACING_FALLBACK_INSTANCES", help = "Fleet size assumed when the fleet service is unavailable.")]
    pub pacing_fallback_instances: Option<u64>,

    #[clap(long, env = "ADX_PACING_FALLBACK_TARGET", help = "Global target used when the fleet service is unavailable.")]
    pub pacing_fallback_target: Option<u64>,

    #[clap(long, env = "ADX_HIGH_VOLUME_COUNTRY", help = "Country whose default pacing cap is doubled.")]
    pub high_volume_country: Option<String>,

    #[clap(long, env = "ADX_MONITOR_INTERVAL_SECONDS", help = "Seconds between two status log lines.")]
    pub monitor_interval_seconds: Option<u64>,

    /// Channel sources, file only.
    #[clap(skip)]
    pub channels: Option<BTreeMap<String, ChannelSource>>,

    /// Affiliate tag (`key=value`) per channel, file only.
    #[clap(skip)]
    pub affiliate_tags: Option<BTreeMap<String, String>>,
}

impl Config {
    fn defaults() -> Config {
        let refresh = RefreshSettings::default();
        let pacing = PacingSettings::default();
        let preprocess = PreprocessSettings::default();
        Config {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            storage: Some("fs".to_string()),
            storage_root: Some(PathBuf::from("./inventory")),
            s3_force_path_style: Some(false),
            base_key: Some(refresh.base_key),
            status_key: Some(refresh.status_key),
            temporary_prefix: Some(refresh.temporary_prefix),
            scan_temporary: Some(refresh.scan_temporary),
            refresh_period_seconds: Some(refresh.period.as_secs()),
            http_timeout_seconds: Some(30),
            max_object_bytes: Some(DEFAULT_MAX_DECODED_BYTES),
            payout_floor: Some(preprocess.payout_floor),
            offline_channel: Some(preprocess.offline_channel),
            fleet_group: Some("adx-bidder".to_string()),
            pacing_global_target: Some(pacing.global_target),
            pacing_fallback_instances: Some(pacing.fallback_instance_count),
            pacing_fallback_target: Some(pacing.fallback_global_target),
            high_volume_country: Some(pacing.high_volume_country),
            monitor_interval_seconds: Some(60),
            ..Default::default()
        }
    }

    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            storage: other.storage.or(self.storage),
            storage_root: other.storage_root.or(self.storage_root),
            s3_bucket: other.s3_bucket.or(self.s3_bucket),
            s3_region: other.s3_region.or(self.s3_region),
            s3_endpoint: other.s3_endpoint.or(self.s3_endpoint),
            s3_force_path_style: other.s3_force_path_style.or(self.s3_force_path_style),
            base_key: other.base_key.or(self.base_key),
            status_key: other.status_key.or(self.status_key),
            temporary_prefix: other.temporary_prefix.or(self.temporary_prefix),
            scan_temporary: other.scan_temporary.or(self.scan_temporary),
            refresh_period_seconds: other.refresh_period_seconds.or(self.refresh_period_seconds),
            http_timeout_seconds: other.http_timeout_seconds.or(self.http_timeout_seconds),
            max_object_bytes: other.max_object_bytes.or(self.max_object_bytes),
            payout_floor: other.payout_floor.or(self.payout_floor),
            offline_channel: other.offline_channel.or(self.offline_channel),
            fleet_url: other.fleet_url.or(self.fleet_url),
            fleet_group: other.fleet_group.or(self.fleet_group),
            pacing_global_target: other.pacing_global_target.or(self.pacing_global_target),
            pacing_fallback_instances: other.pacing_fallback_instances.or(self.pacing_fallback_instances),
            pacing_fallback_target: other.pacing_fallback_target.or(self.pacing_fallback_target),
            high_volume_country: other.high_volume_country.or(self.high_volume_country),
            monitor_interval_seconds: other.monitor_interval_seconds.or(self.monitor_interval_seconds),
            channels: other.channels.or(self.channels),
            affiliate_tags: other.affiliate_tags.or(self.affiliate_tags),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.storage.as_deref() {
            Some("fs") | None => {}
            Some("s3") => {
                if self.s3_bucket.as_deref().is_none_or(str::is_empty) {
                    return Err(ConfigError::Invalid("storage 's3' needs an s3Bucket".to_string()));
                }
            }
            Some(other) => {
                return Err(ConfigError::Invalid(format!("unknown storage backend {other:?}")));
            }
        }
        if self.max_object_bytes == Some(0) {
            return Err(ConfigError::Invalid("maxObjectBytes must be positive".to_string()));
        }
        if self.refresh_period_seconds == Some(0) {
            return Err(ConfigError::Invalid("refreshPeriodSeconds must be positive".to_string()));
        }
        if let Some(tags) = &self.affiliate_tags {
            if let Some((channel, tag)) = tags.iter().find(|(_, tag)| !tag.contains('=')) {
                return Err(ConfigError::Invalid(format!(
                    "affiliate tag {tag:?} of channel {channel} is not key=value"
                )));
            }
        }
        Ok(())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn uses_s3(&self) -> bool {
        self.storage.as_deref() == Some("s3")
    }

    pub fn storage_root(&self) -> PathBuf {
        self.storage_root.clone().unwrap_or_else(|| PathBuf::from("./inventory"))
    }

    pub fn s3_config(&self) -> S3Config {
        S3Config {
            bucket: self.s3_bucket.clone().unwrap_or_default(),
            region: self.s3_region.clone(),
            endpoint_url: self.s3_endpoint.clone(),
            force_path_style: self.s3_force_path_style.unwrap_or(false),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds.unwrap_or(30))
    }

    pub fn max_object_bytes(&self) -> u64 {
        self.max_object_bytes.unwrap_or(DEFAULT_MAX_DECODED_BYTES)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_seconds.unwrap_or(60).max(1))
    }

    pub fn fleet_group(&self) -> &str {
        self.fleet_group.as_deref().unwrap_or("adx-bidder")
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        let defaults = RefreshSettings::default();
        RefreshSettings {
            period: self
                .refresh_period_seconds
                .map_or(defaults.period, Duration::from_secs),
            status_key: self.status_key.clone().unwrap_or(defaults.status_key),
            base_key: self.base_key.clone().unwrap_or(defaults.base_key),
            temporary_prefix: self.temporary_prefix.clone().unwrap_or(defaults.temporary_prefix),
            scan_temporary: self.scan_temporary.unwrap_or(defaults.scan_temporary),
            channels: self.channels.clone().unwrap_or_default(),
        }
    }

    pub fn preprocess_settings(&self) -> PreprocessSettings {
        let defaults = PreprocessSettings::default();
        let profiles = self
            .affiliate_tags
            .iter()
            .flatten()
            .map(|(channel, tag)| {
                (
                    channel.clone(),
                    ChannelProfile {
                        affiliate_tag: Some(tag.clone()),
                    },
                )
            })
            .collect();
        PreprocessSettings {
            payout_floor: self.payout_floor.unwrap_or(defaults.payout_floor),
            offline_channel: self.offline_channel.clone().unwrap_or(defaults.offline_channel),
            profiles,
        }
    }

    pub fn pacing_settings(&self) -> PacingSettings {
        let defaults = PacingSettings::default();
        PacingSettings {
            global_target: self.pacing_global_target.unwrap_or(defaults.global_target),
            fallback_instance_count: self
                .pacing_fallback_instances
                .unwrap_or(defaults.fallback_instance_count),
            fallback_global_target: self
                .pacing_fallback_target
                .unwrap_or(defaults.fallback_global_target),
            high_volume_country: self
                .high_volume_country
                .clone()
                .unwrap_or(defaults.high_volume_country),
            ..defaults
        }
    }
}

/// Layers defaults, then the JSON config file, then `cli` (which already
/// carries environment variables).
pub fn resolve_config(cli: Config) -> Result<Config, ConfigError> {
    let explicit = cli.config_path.is_some();
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();

    if config_file_path.exists() {
        current_config = current_config.merge(read_config_file(&config_file_path)?);
    } else if explicit {
        return Err(ConfigError::Read {
            path: config_file_path,
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
    }

    current_config = current_config.merge(cli);
    current_config.validate()?;
    Ok(current_config)
}

fn read_config_file(path: &Path) -> Result<Config, ConfigError> {
    let config_str = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str::<Config>(&config_str).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_config() -> Result<Config, ConfigError> {
    // clap::Parser handles both CLI arguments and environment variables.
    resolve_config(Config::parse())
}

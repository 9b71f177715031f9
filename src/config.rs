use crate::ingest::writer::UnresolvedPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Application configuration loaded from environment variables or TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Sites accepted at ingestion. Empty accepts any site.
    #[serde(default)]
    pub site_ids: Vec<String>,
    /// Path to a MaxMind GeoLite2 .mmdb file for IP geolocation.
    /// If not set or file is missing, geography stays absent on every fact.
    #[serde(default)]
    pub geoip_db_path: Option<PathBuf>,
    /// Refuse events with an unresolvable dimension instead of recording a partial fact.
    #[serde(default)]
    pub reject_unresolved: bool,
    /// Seconds after 00:00 UTC before the previous day is compacted (default: 120).
    #[serde(default = "default_compaction_delay_secs")]
    pub compaction_delay_secs: u64,
    /// How many past days the repair pass re-checks for stale rollups (default: 7).
    #[serde(default = "default_repair_lookback_days")]
    pub repair_lookback_days: u32,
    /// Graceful shutdown timeout in seconds (default: 30).
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    8000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

const fn default_compaction_delay_secs() -> u64 {
    120
}

const fn default_repair_lookback_days() -> u32 {
    7
}

const fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
            site_ids: Vec::new(),
            geoip_db_path: None,
            reject_unresolved: false,
            compaction_delay_secs: default_compaction_delay_secs(),
            repair_lookback_days: default_repair_lookback_days(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults.
    ///
    /// Environment variables override file values:
    /// - `TIDEMARK_HOST` → host
    /// - `TIDEMARK_PORT` → port
    /// - `TIDEMARK_DATA_DIR` → data_dir
    /// - `TIDEMARK_GEOIP_DB` → geoip_db_path
    /// - `TIDEMARK_REJECT_UNRESOLVED` → reject_unresolved
    /// - `TIDEMARK_COMPACTION_DELAY` → compaction_delay_secs
    /// - `TIDEMARK_REPAIR_LOOKBACK` → repair_lookback_days
    /// - `TIDEMARK_SHUTDOWN_TIMEOUT` → shutdown_timeout_secs
    pub fn load(config_path: Option<&Path>) -> Self {
        let mut config =
            config_path.map_or_else(Self::default, |path| match std::fs::read_to_string(path) {
                Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                    tracing::warn!("Failed to parse config file: {e}, using defaults");
                    Self::default()
                }),
                Err(e) => {
                    tracing::warn!("Failed to read config file: {e}, using defaults");
                    Self::default()
                }
            });

        if let Ok(host) = std::env::var("TIDEMARK_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse("TIDEMARK_PORT") {
            config.port = port;
        }
        if let Ok(data_dir) = std::env::var("TIDEMARK_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Ok(geoip) = std::env::var("TIDEMARK_GEOIP_DB") {
            config.geoip_db_path = Some(PathBuf::from(geoip));
        }
        if let Ok(val) = std::env::var("TIDEMARK_REJECT_UNRESOLVED") {
            config.reject_unresolved = val == "1" || val.eq_ignore_ascii_case("true");
        }
        if let Some(delay) = env_parse("TIDEMARK_COMPACTION_DELAY") {
            config.compaction_delay_secs = delay;
        }
        if let Some(days) = env_parse("TIDEMARK_REPAIR_LOOKBACK") {
            config.repair_lookback_days = days;
        }
        if let Some(secs) = env_parse("TIDEMARK_SHUTDOWN_TIMEOUT") {
            config.shutdown_timeout_secs = secs;
        }

        config
    }

    /// Returns the path to the DuckDB database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("stats.duckdb")
    }

    pub const fn unresolved_policy(&self) -> UnresolvedPolicy {
        if self.reject_unresolved {
            UnresolvedPolicy::Reject
        } else {
            UnresolvedPolicy::RecordWithPlaceholder
        }
    }
}

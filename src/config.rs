use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::Ms;

/// Tuning for the booking engine itself.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a pending claim blocks its interval.
    pub slot_ttl_ms: Ms,
    /// Tries per compensation step before giving up and leaving the claim
    /// to lapse.
    pub compensation_attempts: u32,
    /// Base delay between compensation tries; grows linearly.
    pub compensation_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slot_ttl_ms: 5 * 60 * 1000,
            compensation_attempts: 3,
            compensation_backoff_ms: 25,
        }
    }
}

/// Process-level settings, read from `FLEETSLOT_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub reaper_interval: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub engine: EngineConfig,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or unparsable numbers fall
    /// back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let engine_defaults = EngineConfig::default();
        let slot_ttl_secs: u64 = parsed(&lookup, "FLEETSLOT_SLOT_TTL_SECS")
            .unwrap_or((engine_defaults.slot_ttl_ms / 1000) as u64);

        Self {
            bind: lookup("FLEETSLOT_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&lookup, "FLEETSLOT_PORT").unwrap_or(5433),
            data_dir: PathBuf::from(lookup("FLEETSLOT_DATA_DIR").unwrap_or_else(|| "./data".into())),
            max_connections: parsed(&lookup, "FLEETSLOT_MAX_CONNECTIONS")
                .unwrap_or(256)
                .clamp(1, crate::limits::MAX_CONNECTIONS),
            compact_threshold: parsed(&lookup, "FLEETSLOT_COMPACT_THRESHOLD").unwrap_or(1000),
            reaper_interval: Duration::from_secs(
                parsed(&lookup, "FLEETSLOT_REAPER_INTERVAL_SECS").unwrap_or(5).max(1),
            ),
            metrics_port: parsed(&lookup, "FLEETSLOT_METRICS_PORT"),
            tls_cert: lookup("FLEETSLOT_TLS_CERT"),
            tls_key: lookup("FLEETSLOT_TLS_KEY"),
            engine: EngineConfig {
                slot_ttl_ms: (slot_ttl_secs.max(1) as Ms).saturating_mul(1000),
                ..engine_defaults
            },
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("fleetslot.wal")
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

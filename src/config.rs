//! Runtime configuration.
//!
//! Engine policy lives in the database `config` table (seeded with the
//! defaults below). Process settings come from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::database::Database;
use crate::verify::NetworkThresholds;

/// How session accounting reacts when a user turns their camera and
/// screen share off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableAccounting {
    /// Drop the time accumulated so far and start over.
    Discard,
    /// Persist the time accumulated so far, then start over.
    Persist,
}

impl DisableAccounting {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "discard" => Some(Self::Discard),
            "persist" => Some(Self::Persist),
            _ => None,
        }
    }
}

/// Upper bound for any duration read from the config table (one day).
pub const MAX_CONFIG_DURATION: Duration = Duration::from_secs(86_400);

/// Engine policy.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub grace_period: Duration,
    pub exemption_window: Duration,
    pub verdict_timeout: Duration,
    pub thresholds: NetworkThresholds,
    /// Auto-delete window for most channel notices.
    pub notice_delete_after: Duration,
    /// Auto-delete window for the "on a break" notice after a departure.
    pub departure_delete_after: Duration,
    pub disable_accounting: DisableAccounting,
    pub exemption_sweep_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(300),
            exemption_window: Duration::from_secs(600),
            verdict_timeout: Duration::from_secs(90),
            thresholds: NetworkThresholds::default(),
            notice_delete_after: Duration::from_secs(20),
            departure_delete_after: Duration::from_secs(90),
            disable_accounting: DisableAccounting::Discard,
            exemption_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl MonitorConfig {
    /// Reads policy from the database, falling back to defaults per key.
    pub fn from_database(db: &Database) -> Self {
        let lookup = |key: &str| match db.get_config(key) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, ?e, "Failed to read config value");
                None
            }
        };
        Self::from_lookup(lookup)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let secs = |key: &str, default: Duration| -> Duration {
            match lookup(key).map(|v| v.trim().parse::<u64>()) {
                Some(Ok(v)) if v <= MAX_CONFIG_DURATION.as_secs() => Duration::from_secs(v),
                Some(Ok(v)) => {
                    tracing::warn!(
                        key,
                        value = v,
                        max = MAX_CONFIG_DURATION.as_secs(),
                        "Duration in config too large, clamping"
                    );
                    MAX_CONFIG_DURATION
                }
                Some(Err(_)) => {
                    tracing::warn!(key, "Invalid duration in config, using default");
                    default
                }
                None => default,
            }
        };
        let float = |key: &str, default: f64| -> f64 {
            match lookup(key).map(|v| v.trim().parse::<f64>()) {
                Some(Ok(v)) if v.is_finite() => v,
                Some(_) => {
                    tracing::warn!(key, "Invalid number in config, using default");
                    default
                }
                None => default,
            }
        };

        let disable_accounting = match lookup("disable_accounting") {
            Some(raw) => DisableAccounting::parse(&raw).unwrap_or_else(|| {
                tracing::warn!(value = %raw, "Unknown disable_accounting policy, using discard");
                DisableAccounting::Discard
            }),
            None => defaults.disable_accounting,
        };

        Self {
            grace_period: secs("grace_period_secs", defaults.grace_period),
            exemption_window: secs("exemption_window_secs", defaults.exemption_window),
            verdict_timeout: secs("verdict_timeout_secs", defaults.verdict_timeout),
            thresholds: NetworkThresholds {
                min_download_mbps: float(
                    "min_download_mbps",
                    defaults.thresholds.min_download_mbps,
                ),
                min_upload_mbps: float("min_upload_mbps", defaults.thresholds.min_upload_mbps),
                max_ping_ms: float("max_ping_ms", defaults.thresholds.max_ping_ms),
            },
            notice_delete_after: secs("notice_delete_after_secs", defaults.notice_delete_after),
            departure_delete_after: secs(
                "departure_notice_delete_after_secs",
                defaults.departure_delete_after,
            ),
            disable_accounting,
            exemption_sweep_interval: secs(
                "exemption_sweep_secs",
                defaults.exemption_sweep_interval,
            ),
        }
    }
}

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 13234;

/// Process-level settings read from the environment.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    pub key_dir: PathBuf,
    /// Base URL used when building verification links.
    pub public_url: String,
}

impl ServerSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default_bind = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT));
        let bind = match lookup("STUDYMON_BIND") {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(value = %raw, "Invalid STUDYMON_BIND, using default");
                default_bind
            }),
            None => default_bind,
        };

        let db_path = lookup("STUDYMON_DB")
            .map(PathBuf::from)
            .unwrap_or_else(Database::default_path);

        let key_dir = lookup("STUDYMON_KEY_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("studymon")
            });

        let public_url = lookup("STUDYMON_PUBLIC_URL")
            .unwrap_or_else(|| format!("http://{}", bind))
            .trim_end_matches('/')
            .to_string();

        Self {
            bind,
            db_path,
            key_dir,
            public_url,
        }
    }
}

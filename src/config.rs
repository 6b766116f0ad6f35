use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("both SLOTKEEPER_TLS_CERT and SLOTKEEPER_TLS_KEY must be set, or neither")]
    PartialTls,
    #[error("{0}")]
    Rule(&'static str),
}

/// Knobs for the scheduling engine itself, independent of the server around it.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Slot start times are multiples of this many minutes.
    pub slot_granularity_minutes: u32,
    pub allowed_durations: Vec<u32>,
    /// Bound on waiting for a consultant's commit lock.
    pub commit_timeout: Duration,
    /// Reminder boundaries, in minutes before the booking starts.
    pub reminder_offsets_minutes: Vec<u32>,
    pub follow_up_after_minutes: u32,
    pub max_sync_attempts: u32,
    pub sync_backoff_base: Duration,
    pub sync_backoff_max: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slot_granularity_minutes: 15,
            allowed_durations: vec![30, 45, 60, 90, 120],
            commit_timeout: Duration::from_secs(2),
            reminder_offsets_minutes: vec![24 * 60, 2 * 60],
            follow_up_after_minutes: 24 * 60,
            max_sync_attempts: 5,
            sync_backoff_base: Duration::from_secs(30),
            sync_backoff_max: Duration::from_secs(3600),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_granularity_minutes == 0 {
            return Err(ConfigError::Rule("slot granularity must be positive"));
        }
        if self.allowed_durations.is_empty() || self.allowed_durations.contains(&0) {
            return Err(ConfigError::Rule("allowed durations must be non-empty and positive"));
        }
        if self.max_sync_attempts == 0 {
            return Err(ConfigError::Rule("max sync attempts must be positive"));
        }
        Ok(())
    }

    pub fn is_allowed_duration(&self, minutes: u32) -> bool {
        self.allowed_durations.contains(&minutes)
    }
}

/// Server configuration, read from `SLOTKEEPER_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary variable source (tests pass a map).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            slot_granularity_minutes: parsed(&get, "SLOTKEEPER_SLOT_GRANULARITY_MINUTES")?
                .unwrap_or(defaults.slot_granularity_minutes),
            allowed_durations: list(&get, "SLOTKEEPER_ALLOWED_DURATIONS")?
                .unwrap_or(defaults.allowed_durations),
            commit_timeout: parsed(&get, "SLOTKEEPER_COMMIT_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.commit_timeout),
            reminder_offsets_minutes: list(&get, "SLOTKEEPER_REMINDER_OFFSETS_MINUTES")?
                .unwrap_or(defaults.reminder_offsets_minutes),
            follow_up_after_minutes: parsed(&get, "SLOTKEEPER_FOLLOW_UP_AFTER_MINUTES")?
                .unwrap_or(defaults.follow_up_after_minutes),
            max_sync_attempts: parsed(&get, "SLOTKEEPER_MAX_SYNC_ATTEMPTS")?
                .unwrap_or(defaults.max_sync_attempts),
            sync_backoff_base: parsed(&get, "SLOTKEEPER_SYNC_BACKOFF_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.sync_backoff_base),
            sync_backoff_max: parsed(&get, "SLOTKEEPER_SYNC_BACKOFF_MAX_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.sync_backoff_max),
        };
        engine.validate()?;

        let tls_cert = get("SLOTKEEPER_TLS_CERT");
        let tls_key = get("SLOTKEEPER_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        Ok(Self {
            bind: get("SLOTKEEPER_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&get, "SLOTKEEPER_PORT")?.unwrap_or(5433),
            data_dir: get("SLOTKEEPER_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            password: get("SLOTKEEPER_PASSWORD").unwrap_or_else(|| "slotkeeper".into()),
            max_connections: parsed(&get, "SLOTKEEPER_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&get, "SLOTKEEPER_COMPACT_THRESHOLD")?.unwrap_or(1000),
            tls_cert,
            tls_key,
            metrics_port: parsed(&get, "SLOTKEEPER_METRICS_PORT")?,
            engine,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match get(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

/// Comma-separated list of integers.
fn list(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<Vec<u32>>, ConfigError> {
    let Some(value) = get(var) else {
        return Ok(None);
    };
    value
        .split(',')
        .map(|part| part.trim().parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
        .map_err(|_| ConfigError::Invalid { var, value })
}

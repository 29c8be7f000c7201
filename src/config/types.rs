use std::time::Duration;

use serde::Deserialize;

use crate::args::parse_duration_value;
use crate::error::{AppError, AppResult, ConfigError, ValidationError};

/// Contents of `lockstep.toml` / `lockstep.json`. Every field is optional;
/// values given on the command line win.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub relay: Option<RelayConfig>,
    pub session: Option<SessionConfig>,
    pub download: Option<DownloadConfig>,
    pub clock: Option<ClockConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RelayConfig {
    /// Listen address for `lockstep relay`.
    pub listen: Option<String>,
    /// Relay address `lockstep join` connects to.
    pub address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionConfig {
    pub name: Option<String>,
    pub recorder_id: Option<u64>,
    pub guard_interval: Option<DurationValue>,
    pub tick_interval: Option<DurationValue>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadConfig {
    #[serde(alias = "server")]
    pub servers: Option<Vec<String>>,
    pub cache_dir: Option<String>,
    pub fetch_timeout: Option<DurationValue>,
    pub retry_initial: Option<DurationValue>,
    pub retry_max: Option<DurationValue>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClockConfig {
    pub time_server: Option<String>,
    pub refresh: Option<DurationValue>,
}

/// A duration given either as integer milliseconds or as text like `"2s"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Millis(u64),
    Text(String),
}

impl DurationValue {
    pub(crate) fn to_duration(&self, field: &'static str) -> AppResult<Duration> {
        let parsed = match self {
            DurationValue::Millis(0) => Err(ValidationError::DurationZero),
            DurationValue::Millis(ms) => Ok(Duration::from_millis(*ms)),
            DurationValue::Text(text) => parse_duration_value(text),
        };
        parsed.map_err(|err| {
            AppError::config(ConfigError::InvalidDuration { field, source: err })
        })
    }
}

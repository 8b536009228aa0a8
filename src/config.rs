//! Process configuration, read once from `COURTSIDE_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::engine::Timeouts;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name}: invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// Schedule string for the open-play enforcement job, e.g. `@every 5m`.
    pub enforcement_schedule: String,
    pub enforcement_timeout: Duration,
    pub offer_sweep_interval: Duration,
    /// Appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub timeouts: Timeouts,
    pub from_address: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Timeouts::default();

        Ok(Self {
            data_dir: var("COURTSIDE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            metrics_port: parse_opt(&var, "COURTSIDE_METRICS_PORT")?,
            enforcement_schedule: var("COURTSIDE_ENFORCEMENT_SCHEDULE")
                .unwrap_or_else(|| "@every 5m".into()),
            enforcement_timeout: Duration::from_secs(
                parse_opt(&var, "COURTSIDE_ENFORCEMENT_TIMEOUT_SECS")?.unwrap_or(600),
            ),
            offer_sweep_interval: Duration::from_secs(
                parse_opt(&var, "COURTSIDE_OFFER_SWEEP_SECS")?.unwrap_or(60),
            ),
            compact_threshold: parse_opt(&var, "COURTSIDE_COMPACT_THRESHOLD")?.unwrap_or(1000),
            timeouts: Timeouts {
                query: millis(&var, "COURTSIDE_QUERY_TIMEOUT_MS")?.unwrap_or(defaults.query),
                email: millis(&var, "COURTSIDE_EMAIL_TIMEOUT_MS")?.unwrap_or(defaults.email),
                waitlist: millis(&var, "COURTSIDE_WAITLIST_TIMEOUT_MS")?.unwrap_or(defaults.waitlist),
            },
            from_address: var("COURTSIDE_FROM_ADDRESS")
                .unwrap_or_else(|| "noreply@courtside.local".into()),
        })
    }
}

fn parse_opt<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match var(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

fn millis(var: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<Duration>, ConfigError> {
    match parse_opt::<u64>(var, name)? {
        Some(0) => Err(ConfigError::Invalid {
            name,
            value: "0".into(),
        }),
        other => Ok(other.map(Duration::from_millis)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = config(&[]).unwrap();
        assert_eq!(c.data_dir, PathBuf::from("./data"));
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.enforcement_schedule, "@every 5m");
        assert_eq!(c.compact_threshold, 1000);
        assert_eq!(c.timeouts, Timeouts::default());
        assert_eq!(c.enforcement_timeout, Duration::from_secs(600));
    }

    #[test]
    fn reads_overrides() {
        let c = config(&[
            ("COURTSIDE_DATA_DIR", "/var/lib/courtside"),
            ("COURTSIDE_METRICS_PORT", "9100"),
            ("COURTSIDE_QUERY_TIMEOUT_MS", "250"),
            ("COURTSIDE_FROM_ADDRESS", "desk@club.example"),
        ])
        .unwrap();
        assert_eq!(c.data_dir, PathBuf::from("/var/lib/courtside"));
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.timeouts.query, Duration::from_millis(250));
        assert_eq!(c.from_address, "desk@club.example");
    }

    #[test]
    fn empty_values_fall_back() {
        let c = config(&[("COURTSIDE_METRICS_PORT", "  ")]).unwrap();
        assert_eq!(c.metrics_port, None);
    }

    #[test]
    fn invalid_values_are_errors() {
        let err = config(&[("COURTSIDE_METRICS_PORT", "http")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                name: "COURTSIDE_METRICS_PORT",
                value: "http".into()
            }
        );
        assert!(config(&[("COURTSIDE_EMAIL_TIMEOUT_MS", "0")]).is_err());
        assert!(config(&[("COURTSIDE_COMPACT_THRESHOLD", "-1")]).is_err());
    }
}

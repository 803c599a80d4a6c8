use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;

use crate::engine::DEFAULT_SLOT_GRANULARITY;
use crate::limits::{MAX_GRANULARITY_MINUTES, MIN_GRANULARITY_MINUTES};
use crate::model::Minute;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{var}: {reason}")]
    OutOfRange { var: &'static str, reason: &'static str },
}

/// Server settings, read from `SLOTLINE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    /// Directory holding the WAL.
    pub data_dir: PathBuf,
    /// Prometheus exporter port; disabled when unset.
    pub metrics_port: Option<u16>,
    /// Appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub slot_granularity: Minute,
    /// Unpaid bookings older than this are cancelled; never when unset.
    pub pending_payment_ttl: Option<TimeDelta>,
    pub reaper_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            slot_granularity: DEFAULT_SLOT_GRANULARITY,
            pending_payment_ttl: None,
            reaper_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let slot_granularity = parse::<Minute>(&lookup, "SLOTLINE_SLOT_GRANULARITY_MINUTES")?
            .unwrap_or(defaults.slot_granularity);
        if !(MIN_GRANULARITY_MINUTES..=MAX_GRANULARITY_MINUTES).contains(&slot_granularity) {
            return Err(ConfigError::OutOfRange {
                var: "SLOTLINE_SLOT_GRANULARITY_MINUTES",
                reason: "must be between 5 and 240",
            });
        }

        let pending_payment_ttl = match parse::<i64>(&lookup, "SLOTLINE_PENDING_PAYMENT_TTL_MINUTES")? {
            Some(m) if m <= 0 => {
                return Err(ConfigError::OutOfRange {
                    var: "SLOTLINE_PENDING_PAYMENT_TTL_MINUTES",
                    reason: "must be positive",
                });
            }
            other => other.map(TimeDelta::minutes),
        };

        let secs = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match parse::<u64>(&lookup, var)? {
                Some(0) => Err(ConfigError::OutOfRange { var, reason: "must be positive" }),
                Some(s) => Ok(Duration::from_secs(s)),
                None => Ok(default),
            }
        };

        Ok(Self {
            bind: lookup("SLOTLINE_BIND")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.bind),
            port: parse(&lookup, "SLOTLINE_PORT")?.unwrap_or(defaults.port),
            data_dir: lookup("SLOTLINE_DATA_DIR")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: parse(&lookup, "SLOTLINE_METRICS_PORT")?,
            compact_threshold: parse(&lookup, "SLOTLINE_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            slot_granularity,
            pending_payment_ttl,
            reaper_interval: secs("SLOTLINE_REAPER_INTERVAL_SECS", defaults.reaper_interval)?,
            request_timeout: secs("SLOTLINE_REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotline.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
        assert_eq!(config.wal_path(), PathBuf::from("./data/slotline.wal"));
    }

    #[test]
    fn reads_overrides() {
        let config = from_pairs(&[
            ("SLOTLINE_PORT", "9000"),
            ("SLOTLINE_DATA_DIR", "/var/lib/slotline"),
            ("SLOTLINE_METRICS_PORT", "9100"),
            ("SLOTLINE_SLOT_GRANULARITY_MINUTES", "15"),
            ("SLOTLINE_PENDING_PAYMENT_TTL_MINUTES", "30"),
            ("SLOTLINE_REAPER_INTERVAL_SECS", "5"),
        ])
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/slotline"));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.slot_granularity, 15);
        assert_eq!(config.pending_payment_ttl, Some(TimeDelta::minutes(30)));
        assert_eq!(config.reaper_interval, Duration::from_secs(5));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = from_pairs(&[("SLOTLINE_PORT", " "), ("SLOTLINE_BIND", "")]).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind, "0.0.0.0");
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            from_pairs(&[("SLOTLINE_PORT", "eighty")]),
            Err(ConfigError::Invalid { var: "SLOTLINE_PORT", .. })
        ));
        assert!(matches!(
            from_pairs(&[("SLOTLINE_SLOT_GRANULARITY_MINUTES", "1")]),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert!(matches!(
            from_pairs(&[("SLOTLINE_PENDING_PAYMENT_TTL_MINUTES", "0")]),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert!(matches!(
            from_pairs(&[("SLOTLINE_REQUEST_TIMEOUT_SECS", "0")]),
            Err(ConfigError::OutOfRange { .. })
        ));
    }
}

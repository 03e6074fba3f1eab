//! Configuration structures.
//!
//! The runtime reads its settings from the flat key/value entries of the
//! root [`Context`]. Every recognised key is listed in [`CONFIG_KEYS`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::context::Context;
use crate::types::{Error, Result};

pub const KEY_SHUTDOWN_TIMEOUT: &str = "runtime.shutdown.timeout";
pub const KEY_SHUTDOWN_PARALLEL: &str = "runtime.shutdown.parallel";
pub const KEY_SCHEDULER_HEARTBEAT: &str = "runtime.scheduler.heartbeat";
pub const KEY_AWAIT_TIMEOUT: &str = "runtime.await.timeout";
pub const KEY_LOG_LEVEL: &str = "runtime.log.level";
pub const KEY_LOG_FORMAT: &str = "runtime.log.format";
pub const KEY_PROFILE: &str = "runtime.profile";

/// A recognised configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConfigKey {
    pub key: &'static str,
    pub description: &'static str,
    pub default: &'static str,
    /// Value is masked when printed.
    pub secret: bool,
}

/// Every key the kernel understands.
pub const CONFIG_KEYS: &[ConfigKey] = &[
    ConfigKey {
        key: KEY_SHUTDOWN_TIMEOUT,
        description: "Upper bound for each shutdown stage",
        default: "10s",
        secret: false,
    },
    ConfigKey {
        key: KEY_SHUTDOWN_PARALLEL,
        description: "Stop all services concurrently instead of in reverse registration order",
        default: "false",
        secret: false,
    },
    ConfigKey {
        key: KEY_SCHEDULER_HEARTBEAT,
        description: "Interval of the sweep that drops terminated schedulers",
        default: "60s",
        secret: false,
    },
    ConfigKey {
        key: KEY_AWAIT_TIMEOUT,
        description: "How long await helpers wait for a batch of tasks",
        default: "30s",
        secret: false,
    },
    ConfigKey {
        key: KEY_LOG_LEVEL,
        description: "Log level for runtime loggers (trace, debug, info, warn, error)",
        default: "info",
        secret: false,
    },
    ConfigKey {
        key: KEY_LOG_FORMAT,
        description: "Log output format (text or json)",
        default: "text",
        secret: false,
    },
    ConfigKey {
        key: KEY_PROFILE,
        description: "Profile selecting application-<profile>.properties",
        default: "",
        secret: false,
    },
];

/// How services are stopped during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// One at a time, most recently registered first.
    #[default]
    Sequential,
    /// All at once; waits for every stop to finish.
    Parallel,
}

/// Runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Per-stage shutdown timeout.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    pub shutdown_mode: ShutdownMode,

    /// Heartbeat of the terminated-scheduler sweep.
    #[serde(with = "humantime_serde")]
    pub scheduler_heartbeat: Duration,

    /// Bound for await helpers.
    #[serde(with = "humantime_serde")]
    pub await_timeout: Duration,

    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(10),
            shutdown_mode: ShutdownMode::Sequential,
            scheduler_heartbeat: Duration::from_secs(60),
            await_timeout: Duration::from_secs(30),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl RuntimeConfig {
    /// Read the runtime keys from a context; missing keys keep their default.
    pub fn from_context(ctx: &Context) -> Result<Self> {
        Self::from_lookup(|key| ctx.get(key).map(str::to_string))
    }

    /// Read the runtime keys through an arbitrary lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup(KEY_SHUTDOWN_TIMEOUT) {
            config.shutdown_timeout = parse_duration(KEY_SHUTDOWN_TIMEOUT, &v)?;
        }
        if let Some(v) = lookup(KEY_SHUTDOWN_PARALLEL) {
            config.shutdown_mode = if parse_bool(KEY_SHUTDOWN_PARALLEL, &v)? {
                ShutdownMode::Parallel
            } else {
                ShutdownMode::Sequential
            };
        }
        if let Some(v) = lookup(KEY_SCHEDULER_HEARTBEAT) {
            config.scheduler_heartbeat = parse_duration(KEY_SCHEDULER_HEARTBEAT, &v)?;
        }
        if let Some(v) = lookup(KEY_AWAIT_TIMEOUT) {
            config.await_timeout = parse_duration(KEY_AWAIT_TIMEOUT, &v)?;
        }
        if let Some(v) = lookup(KEY_LOG_LEVEL) {
            let level = v.trim().to_ascii_lowercase();
            if !matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error" | "off") {
                return Err(Error::config(format!("{KEY_LOG_LEVEL}: unknown level '{v}'")));
            }
            config.log_level = level;
        }
        if let Some(v) = lookup(KEY_LOG_FORMAT) {
            config.json_logs = match v.trim().to_ascii_lowercase().as_str() {
                "json" => true,
                "text" | "" => false,
                other => {
                    return Err(Error::config(format!("{KEY_LOG_FORMAT}: unknown format '{other}'")))
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler_heartbeat.is_zero() {
            return Err(Error::config(format!("{KEY_SCHEDULER_HEARTBEAT} must be positive")));
        }
        Ok(())
    }

    pub fn with_shutdown_mode(mut self, mode: ShutdownMode) -> Self {
        self.shutdown_mode = mode;
        self
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime_serde::re::humantime::parse_duration(value.trim())
        .map_err(|e| Error::config(format!("{key}: invalid duration '{value}': {e}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(Error::config(format!("{key}: invalid boolean '{value}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_empty() {
        let config = RuntimeConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.shutdown_mode, ShutdownMode::Sequential);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_parse_all_keys() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (KEY_SHUTDOWN_TIMEOUT, "250ms"),
            (KEY_SHUTDOWN_PARALLEL, "true"),
            (KEY_SCHEDULER_HEARTBEAT, "2s"),
            (KEY_AWAIT_TIMEOUT, "1m"),
            (KEY_LOG_LEVEL, "DEBUG"),
            (KEY_LOG_FORMAT, "json"),
        ]))
        .unwrap();

        assert_eq!(config.shutdown_timeout, Duration::from_millis(250));
        assert_eq!(config.shutdown_mode, ShutdownMode::Parallel);
        assert_eq!(config.scheduler_heartbeat, Duration::from_secs(2));
        assert_eq!(config.await_timeout, Duration::from_secs(60));
        assert_eq!(config.log_level, "debug");
        assert!(config.json_logs);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = RuntimeConfig::from_lookup(lookup(&[(KEY_SHUTDOWN_TIMEOUT, "soon")])).unwrap_err();
        assert!(err.to_string().contains(KEY_SHUTDOWN_TIMEOUT));

        assert!(RuntimeConfig::from_lookup(lookup(&[(KEY_SHUTDOWN_PARALLEL, "maybe")])).is_err());
        assert!(RuntimeConfig::from_lookup(lookup(&[(KEY_SCHEDULER_HEARTBEAT, "0s")])).is_err());
        assert!(RuntimeConfig::from_lookup(lookup(&[(KEY_LOG_LEVEL, "loud")])).is_err());
    }

    #[test]
    fn test_every_key_documented() {
        for key in CONFIG_KEYS {
            assert!(key.key.starts_with("runtime."));
            assert!(!key.description.is_empty());
        }
    }
}

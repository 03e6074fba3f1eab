//! Observability utilities.
//!
//! [`init_tracing`] installs the process-wide subscriber. [`Logger`] is the
//! handle a [`Context`](crate::context::Context) carries: every derived
//! context gets a fresh one that shares the runtime's configured level.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::{fmt as sub_fmt, prelude::*, EnvFilter};

use crate::types::RuntimeConfig;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Initialize tracing subscriber once for the process.
///
/// Log format defaults to plain text and can be switched to JSON via
/// `runtime.log.format=json` or `RELAY_LOG_FORMAT=json`. `RUST_LOG` wins over
/// the configured level when set.
pub fn init_tracing(config: &RuntimeConfig) {
    TRACING_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
        let json = config.json_logs
            || std::env::var("RELAY_LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false);

        let result = if json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(sub_fmt::layer().json())
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(sub_fmt::layer().compact())
                .try_init()
        };

        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
    });
}

/// Parse a configured level; unknown strings fall back to `INFO`.
pub fn parse_level(level: &str) -> LevelFilter {
    LevelFilter::from_str(level.trim()).unwrap_or(LevelFilter::INFO)
}

macro_rules! publish_at {
    ($level:expr, $logger:expr, $msg:expr, $err:expr, $fatal:expr) => {
        match $err {
            Some(err) => tracing::event!(
                $level,
                logger = %$logger.name,
                trace_id = %$logger.trace_id,
                fatal = $fatal,
                error = %err,
                "{}",
                $msg
            ),
            None => tracing::event!(
                $level,
                logger = %$logger.name,
                trace_id = %$logger.trace_id,
                fatal = $fatal,
                "{}",
                $msg
            ),
        }
    };
}

/// Named, leveled logger bound to one trace id.
///
/// Messages are closures so formatting only happens when the level is
/// enabled. Records go to whatever tracing subscriber is installed.
#[derive(Clone)]
pub struct Logger {
    name: Arc<str>,
    trace_id: Arc<str>,
    level: LevelFilter,
}

impl Logger {
    pub fn new(name: &str, trace_id: &str, level: LevelFilter) -> Self {
        Self {
            name: Arc::from(name),
            trace_id: Arc::from(trace_id),
            level,
        }
    }

    /// Derive a logger with a new name and trace id, keeping the level.
    pub fn derive(&self, name: &str, trace_id: &str) -> Self {
        Self::new(name, trace_id, self.level)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level
    }

    pub fn trace(&self, msg: impl FnOnce() -> String) {
        self.publish(Level::TRACE, msg, None, false);
    }

    pub fn debug(&self, msg: impl FnOnce() -> String) {
        self.publish(Level::DEBUG, msg, None, false);
    }

    pub fn info(&self, msg: impl FnOnce() -> String) {
        self.publish(Level::INFO, msg, None, false);
    }

    pub fn warn(&self, msg: impl FnOnce() -> String) {
        self.publish(Level::WARN, msg, None, false);
    }

    pub fn error(&self, msg: impl FnOnce() -> String) {
        self.publish(Level::ERROR, msg, None, false);
    }

    pub fn warn_with_error(&self, err: &dyn std::error::Error, msg: impl FnOnce() -> String) {
        self.publish(Level::WARN, msg, Some(err), false);
    }

    pub fn error_with_error(&self, err: &dyn std::error::Error, msg: impl FnOnce() -> String) {
        self.publish(Level::ERROR, msg, Some(err), false);
    }

    /// Highest severity; emitted at `ERROR` with `fatal = true`.
    pub fn fatal(&self, msg: impl FnOnce() -> String) {
        self.publish(Level::ERROR, msg, None, true);
    }

    fn publish(
        &self,
        level: Level,
        msg: impl FnOnce() -> String,
        err: Option<&dyn std::error::Error>,
        fatal: bool,
    ) {
        if !self.enabled(level) {
            return;
        }
        let msg = msg();
        match level {
            Level::TRACE => publish_at!(Level::TRACE, self, msg, err, fatal),
            Level::DEBUG => publish_at!(Level::DEBUG, self, msg, err, fatal),
            Level::INFO => publish_at!(Level::INFO, self, msg, err, fatal),
            Level::WARN => publish_at!(Level::WARN, self, msg, err, fatal),
            _ => publish_at!(Level::ERROR, self, msg, err, fatal),
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("name", &self.name)
            .field("trace_id", &self.trace_id)
            .field("level", &self.level)
            .finish()
    }
}

//! Core types for the relay kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ServiceId, SchedulerId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Runtime configuration and the recognised key table

mod config;
mod errors;
mod ids;

pub use config::{
    ConfigKey, RuntimeConfig, ShutdownMode, CONFIG_KEYS, KEY_AWAIT_TIMEOUT, KEY_LOG_FORMAT,
    KEY_LOG_LEVEL, KEY_PROFILE, KEY_SCHEDULER_HEARTBEAT, KEY_SHUTDOWN_PARALLEL,
    KEY_SHUTDOWN_TIMEOUT,
};
pub use errors::{BoxError, Error, Panicked, Result};
pub(crate) use errors::panic_message;
pub use ids::{random_suffix, SchedulerId, ServiceId};

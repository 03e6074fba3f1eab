//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type returned by user code: listeners, services and scheduled work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error enum for the relay kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid argument supplied by the caller.
    #[error("validation error: {0}")]
    Validation(String),

    /// The runtime is not accepting new work (not started or shutting down).
    #[error("runtime not ready: {0}")]
    NotReady(String),

    /// Configuration could not be loaded or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for errors caused by the runtime refusing work.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Error::NotReady(_))
    }
}

/// Render a caught panic payload as text.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Error produced when a handler panics instead of returning.
#[derive(Error, Debug)]
#[error("panicked: {0}")]
pub struct Panicked(pub String);

impl Panicked {
    pub(crate) fn boxed(panic: &(dyn std::any::Any + Send)) -> BoxError {
        Box::new(Panicked(panic_message(panic)))
    }
}

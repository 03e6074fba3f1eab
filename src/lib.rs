//! # Relay Kernel - Embeddable Event Runtime
//!
//! An in-process application runtime providing:
//! - Named channels with listener registration and typed payloads
//! - Synchronous and asynchronous send/broadcast with explicit acknowledgments
//! - Service lifecycle (start/stop/on_event/on_failure) with readiness gating
//! - Delayed and periodic scheduling on a shared work pool
//! - Three-tier failure escalation ending in an unhandled channel
//! - Bounded, idempotent shutdown
//!
//! ## Architecture
//!
//! A single [`Runtime`] facade composes the collaborating parts:
//! ```text
//!                    ┌─────────────────────────────────┐
//!   Context ───────► │            Runtime              │
//!                    │  ┌─────────┐ ┌──────────┐       │
//!                    │  │Listeners│ │ Services │       │
//!                    │  └─────────┘ └──────────┘       │
//!                    │  ┌─────────┐ ┌──────────┐       │
//!                    │  │WorkPool │ │Schedulers│       │
//!                    │  └─────────┘ └──────────┘       │
//!                    └─────────────────────────────────┘
//! ```
//!
//! ```no_run
//! use relay_kernel::{channel, Payload, Reply, Runtime};
//!
//! # async fn demo() -> relay_kernel::Result<()> {
//! let runtime = Runtime::builder().entry("app.name", "demo").build()?;
//! let ping = channel("PING");
//! runtime.listen(ping, |_| Ok(Reply::with("pong")));
//!
//! let response = runtime.context().send_event(ping, Payload::empty());
//! assert_eq!(response.value_as::<&str>(), Some(&"pong"));
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod context;
pub mod events;
pub mod kernel;
pub mod loader;
pub mod types;

// Internal utilities
pub mod observability;

pub use context::{Context, TraceChain};
pub use events::{
    builtin, channel, channel_name, ChannelId, ChannelRegistry, Event, HandlerResult, Listener,
    ListenerRef, Payload, Reply, Response,
};
pub use kernel::{
    await_all, Failure, FailureOrigin, Runtime, RuntimeBuilder, RuntimeStats, ScheduleKind,
    Scheduler, Service, ServiceHandle, ServiceStartup, ServiceState, TaskHandle, TaskOutcome,
    WorkPool,
};
pub use loader::{mask_secrets, ConfigLoader};
pub use types::{BoxError, Error, Result, RuntimeConfig, ShutdownMode};

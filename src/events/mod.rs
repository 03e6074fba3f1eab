//! Events, channels and listeners.
//!
//! - [`ChannelRegistry`]: name ↔ id table, process-wide via [`channel`]
//! - [`Event`]: immutable envelope handed to listeners and services
//! - [`Reply`] / [`Response`]: explicit acknowledgment results
//! - [`ListenerRegistry`]: channel → ordered listener set

mod channel;
mod event;
mod listener;

pub use channel::{channel, channel_name, ChannelId, ChannelRegistry};
pub use event::{Event, HandlerResult, Payload, Reply, Response, ResponseCallback};
pub use listener::{Listener, ListenerRef, ListenerRegistry};

/// Names of the channels the runtime itself uses.
pub mod builtin {
    /// Escalation target for failures nobody acknowledged.
    pub const UNHANDLED: &str = "runtime.unhandled";
    pub const SERVICE_REGISTER: &str = "runtime.service.register";
    pub const SERVICE_UNREGISTER: &str = "runtime.service.unregister";
    pub const SCHEDULER_REGISTER: &str = "runtime.scheduler.register";
    pub const SCHEDULER_UNREGISTER: &str = "runtime.scheduler.unregister";
}

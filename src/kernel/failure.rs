//! Failure escalation.
//!
//! ```text
//! failure ──► service.on_failure()      (service lifecycle / service dispatch only)
//!               └─ Pass ──► send(UNHANDLED, Failure)
//!                             └─ unacknowledged ──► error log
//! ```
//!
//! Failures raised while dispatching on the unhandled channel itself are
//! logged and go no further, so a broken unhandled handler cannot loop.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::dispatch::guard_call;
use super::pool::SharedError;
use super::services::ServiceHandle;
use super::Runtime;
use crate::context::Context;
use crate::events::{Event, Payload};
use crate::types::SchedulerId;

/// Where a failure came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum FailureOrigin {
    Listener,
    /// A service's `on_event`.
    Service(String),
    ServiceStart(String),
    ServiceStop(String),
    Scheduler(SchedulerId),
}

impl fmt::Display for FailureOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureOrigin::Listener => write!(f, "listener"),
            FailureOrigin::Service(name) => write!(f, "service {name}"),
            FailureOrigin::ServiceStart(name) => write!(f, "start of service {name}"),
            FailureOrigin::ServiceStop(name) => write!(f, "stop of service {name}"),
            FailureOrigin::Scheduler(id) => write!(f, "scheduler {id}"),
        }
    }
}

/// Payload of the unhandled channel.
#[derive(Clone)]
pub struct Failure {
    pub origin: FailureOrigin,
    /// Channel name of the event being processed, if any.
    pub event: Option<Arc<str>>,
    /// Type name of that event's payload.
    pub payload_type: Option<&'static str>,
    pub error: SharedError,
}

impl Failure {
    pub fn new(origin: FailureOrigin, error: SharedError) -> Self {
        Self {
            origin,
            event: None,
            payload_type: None,
            error,
        }
    }

    pub fn during(mut self, event: &Event) -> Self {
        self.event = Some(event.name());
        self.payload_type = Some(event.payload().type_name());
        self
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("origin", &self.origin)
            .field("event", &self.event)
            .field("payload_type", &self.payload_type)
            .field("error", &self.error.to_string())
            .finish()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed", self.origin)?;
        if let Some(event) = &self.event {
            write!(f, " on {event}")?;
        }
        write!(f, ": {}", self.error)
    }
}

impl Runtime {
    /// Three-tier escalation: service hook, unhandled channel, error log.
    pub(crate) fn escalate(&self, ctx: &Context, failure: Failure, service: Option<&ServiceHandle>) {
        if let Some(service) = service {
            match guard_call(|| Ok(service.service().on_failure(&failure))) {
                Ok(reply) if reply.is_ack() => {
                    tracing::debug!(service = %service.name(), failure = %failure, "failure_handled_by_service");
                    return;
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(
                    service = %service.name(),
                    error = %err,
                    "service_on_failure_panicked"
                ),
            }
        }

        let unhandled = self.inner.builtin.unhandled;
        let response = self.send(unhandled, ctx, Payload::new(failure.clone()));
        if !response.acknowledged {
            log_unhandled(&failure);
        }
    }
}

/// Task outcome for work whose failure was already escalated.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub(crate) struct Escalated(pub SharedError);

pub(crate) fn log_unhandled(failure: &Failure) {
    tracing::error!(
        origin = %failure.origin,
        event = failure.event.as_deref().unwrap_or("-"),
        payload = failure.payload_type.unwrap_or("-"),
        error = %failure.error,
        "unhandled_failure"
    );
}

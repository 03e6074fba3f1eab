//! Event dispatch.
//!
//! ```text
//! send(ch, ctx, payload)
//!   ├─ listeners[ch]  (insertion order, fault boundary each)
//!   │     └─ ack && !broadcast ──► return
//!   └─ services       (registration order, ready only; skipped on
//!                      the register/unregister channels)
//!         └─ ack && !broadcast ──► return
//! ```
//!
//! Listeners and services are snapshotted before the walk; registrations
//! made mid-dispatch are seen by the next dispatch. No lock is held while a
//! handler runs.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;

use super::failure::{log_unhandled, Failure, FailureOrigin};
use super::pool::TaskHandle;
use super::services::ServiceHandle;
use super::Runtime;
use crate::context::Context;
use crate::events::{ChannelId, Event, Payload, Reply, Response, ResponseCallback};
use crate::types::{panic_message, BoxError, Panicked};

/// Run a handler, turning a panic into an error.
pub(crate) fn guard_call<T>(
    f: impl FnOnce() -> Result<T, BoxError>,
) -> Result<T, BoxError> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => Err(Panicked::boxed(panic.as_ref())),
    }
}

/// Await a lifecycle future, turning a panic into an error.
pub(crate) async fn guard_future<F>(fut: F) -> Result<(), BoxError>
where
    F: Future<Output = Result<(), BoxError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(Panicked::boxed(panic.as_ref())),
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        InFlight(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Runtime {
    /// Synchronous send: stops at the first acknowledgment.
    pub fn send(&self, channel: ChannelId, ctx: &Context, payload: Payload) -> Response {
        self.dispatch(Event::new(channel, ctx.clone(), payload, false), None)
    }

    /// Synchronous broadcast: every listener and ready service is invoked.
    pub fn broadcast(&self, channel: ChannelId, ctx: &Context, payload: Payload) -> Response {
        self.dispatch(Event::new(channel, ctx.clone(), payload, true), None)
    }

    /// Dispatch on the work pool with a child context and return at once.
    ///
    /// `callback` is called with the accumulated [`Response`] at every
    /// acknowledgment: zero, one or many times, the last call holding the
    /// final value.
    pub fn send_with(
        &self,
        channel: ChannelId,
        ctx: &Context,
        payload: Payload,
        broadcast: bool,
        callback: impl Fn(&Response) + Send + Sync + 'static,
    ) -> TaskHandle {
        let ctx = ctx.child("send");
        let callback: ResponseCallback = Arc::new(callback);
        let runtime = self.clone();

        self.inner
            .pool
            .submit("send", Some(ctx.clone()), async move {
                let event = Event::new(channel, ctx, payload, broadcast);
                runtime.dispatch(event, Some(&callback));
                Ok(())
            })
    }

    pub(crate) fn dispatch(&self, event: Event, callback: Option<&ResponseCallback>) -> Response {
        let mut response = Response::default();
        if !event.channel().is_valid() {
            tracing::debug!(channel = %event.channel(), "dispatch_on_invalid_channel");
            return response;
        }

        let _in_flight = InFlight::enter(&self.inner.in_flight);
        let broadcast = event.is_broadcast();

        for listener in self.inner.listeners.snapshot(event.channel()) {
            match guard_call(|| listener.on_event(&event)) {
                Ok(reply) => {
                    if acknowledge(&mut response, reply, callback) && !broadcast {
                        return response;
                    }
                }
                Err(err) => self.handler_failed(&event, FailureOrigin::Listener, err, None),
            }
        }

        if self.inner.builtin.is_registration(event.channel()) {
            return response;
        }

        for service in self.inner.services.snapshot() {
            let Some(result) = service
                .cell()
                .run_if_ready(|| guard_call(|| service.service().on_event(&event)))
            else {
                continue;
            };
            match result {
                Ok(reply) => {
                    if acknowledge(&mut response, reply, callback) && !broadcast {
                        return response;
                    }
                }
                Err(err) => {
                    let origin = FailureOrigin::Service(service.name().to_string());
                    self.handler_failed(&event, origin, err, Some(&service));
                }
            }
        }

        response
    }

    fn handler_failed(
        &self,
        event: &Event,
        origin: FailureOrigin,
        err: BoxError,
        service: Option<&ServiceHandle>,
    ) {
        let failure = Failure::new(origin, Arc::from(err)).during(event);
        if event.channel() == self.inner.builtin.unhandled {
            log_unhandled(&failure);
            return;
        }
        tracing::warn!(
            event = %event.name(),
            payload = event.payload().type_name(),
            failure = %failure,
            "event_handler_failed"
        );
        self.escalate(event.context(), failure, service);
    }
}

fn acknowledge(
    response: &mut Response,
    reply: Reply,
    callback: Option<&ResponseCallback>,
) -> bool {
    if !response.record(reply) {
        return false;
    }
    if let Some(callback) = callback {
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(response))) {
            tracing::error!(
                panic = %panic_message(panic.as_ref()),
                "response_callback_panicked"
            );
        }
    }
    true
}

//! Service lifecycle and registry.
//!
//! Services enter the registry only through the service register channel,
//! after `start()` returned successfully, and leave it through the
//! unregister channel as soon as `stop()` begins (or directly, once shutdown
//! has cleared the listeners). The state flips first so concurrent
//! dispatches see the service as not ready before teardown.

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::dispatch::guard_future;
use super::failure::{Escalated, Failure, FailureOrigin};
use super::pool::{await_all, SharedError, TaskHandle};
use super::readiness::{ServiceState, StateCell};
use super::{payload_listener, Runtime, RuntimeInner};
use crate::context::Context;
use crate::events::{Event, HandlerResult, ListenerRef, Payload, Reply};
use crate::observability::Logger;
use crate::types::{BoxError, Error, Result, ServiceId};

// =============================================================================
// Service trait
// =============================================================================

/// A managed component with a start/stop lifecycle that can receive events.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn start(&self, ctx: &Context) -> std::result::Result<(), BoxError>;

    async fn stop(&self, ctx: &Context) -> std::result::Result<(), BoxError>;

    /// Called for every event that reaches services while this one is ready.
    fn on_event(&self, _event: &Event) -> HandlerResult {
        Ok(Reply::Pass)
    }

    /// First chance to handle a failure raised by this service. Returning
    /// an acknowledgment stops escalation.
    fn on_failure(&self, _failure: &Failure) -> Reply {
        Reply::Pass
    }
}

// =============================================================================
// Service handle
// =============================================================================

struct HandleInner {
    id: ServiceId,
    name: Arc<str>,
    service: Arc<dyn Service>,
    created_at: DateTime<Utc>,
    state: StateCell,
    context: Context,
}

/// A service together with its identity and lifecycle state.
#[derive(Clone)]
pub struct ServiceHandle {
    inner: Arc<HandleInner>,
}

impl ServiceHandle {
    fn new(service: Arc<dyn Service>, parent: &Context) -> Self {
        let name: Arc<str> = Arc::from(service.name());
        Self {
            inner: Arc::new(HandleInner {
                id: ServiceId::new(),
                context: parent.child(&name),
                name,
                service,
                created_at: Utc::now(),
                state: StateCell::new(ServiceState::NotStarted),
            }),
        }
    }

    pub fn id(&self) -> &ServiceId {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.inner.service
    }

    pub fn state(&self) -> ServiceState {
        self.inner.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.is_ready()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Context the service's lifecycle hooks run with.
    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    pub fn logger(&self) -> Option<&Logger> {
        self.inner.context.logger()
    }

    pub fn ptr_eq(&self, other: &ServiceHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn cell(&self) -> &StateCell {
        &self.inner.state
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("created_at", &self.inner.created_at)
            .finish()
    }
}

/// Returned by [`Runtime::start_service`]; `task` finishes when `start()`
/// has returned and the service is registered (or its failure escalated).
#[derive(Debug, Clone)]
pub struct ServiceStartup {
    pub service: ServiceHandle,
    pub task: TaskHandle,
}

// =============================================================================
// Service registry
// =============================================================================

/// Registration-ordered service list. Duplicates of one concrete type may
/// coexist; removal is by handle identity.
#[derive(Default)]
pub(crate) struct ServiceRegistry {
    services: RwLock<Vec<ServiceHandle>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, handle: ServiceHandle) -> bool {
        let mut services = self.services.write();
        if services.iter().any(|s| s.ptr_eq(&handle)) {
            return false;
        }
        services.push(handle);
        true
    }

    pub fn remove(&self, handle: &ServiceHandle) -> bool {
        let mut services = self.services.write();
        let before = services.len();
        services.retain(|s| !s.ptr_eq(handle));
        services.len() != before
    }

    pub fn snapshot(&self) -> Vec<ServiceHandle> {
        self.services.read().clone()
    }

    pub fn find(&self, name: &str) -> Option<ServiceHandle> {
        self.services
            .read()
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }
}

pub(crate) fn register_listener(runtime: Weak<RuntimeInner>) -> ListenerRef {
    payload_listener::<ServiceHandle, _>(move |handle: &ServiceHandle| {
        runtime
            .upgrade()
            .is_some_and(|inner| inner.services.add(handle.clone()))
    })
}

pub(crate) fn unregister_listener(runtime: Weak<RuntimeInner>) -> ListenerRef {
    payload_listener::<ServiceHandle, _>(move |handle: &ServiceHandle| {
        runtime
            .upgrade()
            .is_some_and(|inner| inner.services.remove(handle))
    })
}

// =============================================================================
// Runtime lifecycle operations
// =============================================================================

impl Runtime {
    /// Start a service on the work pool.
    pub fn start_service<S: Service>(&self, service: S) -> Result<ServiceStartup> {
        self.start_shared(Arc::new(service))
    }

    /// Start an already shared service.
    pub fn start_shared(&self, service: Arc<dyn Service>) -> Result<ServiceStartup> {
        if !self.is_ready() {
            return Err(Error::not_ready(format!(
                "cannot start service {}: runtime is shutting down",
                service.name()
            )));
        }

        let handle = ServiceHandle::new(service, &self.inner.root);
        let runtime = self.clone();
        let starting = handle.clone();
        let task = self.inner.pool.submit_escalated(
            &format!("start:{}", handle.name()),
            Some(handle.context().clone()),
            async move { runtime.run_start(starting).await },
        );

        Ok(ServiceStartup {
            service: handle,
            task,
        })
    }

    async fn run_start(&self, handle: ServiceHandle) -> std::result::Result<(), BoxError> {
        let ctx = handle.context().clone();
        if let Err(err) = guard_future(handle.service().start(&ctx)).await {
            let err: SharedError = Arc::from(err);
            handle.cell().transition(ServiceState::NotStarted, ServiceState::Stopped);
            let origin = FailureOrigin::ServiceStart(handle.name().to_string());
            self.escalate(&ctx, Failure::new(origin, err.clone()), Some(&handle));
            return Err(Box::new(Escalated(err)));
        }

        handle.cell().transition(ServiceState::NotStarted, ServiceState::Ready);
        let registered = self
            .broadcast(self.inner.builtin.service_register, &ctx, Payload::new(handle.clone()))
            .acknowledged;
        if !registered {
            tracing::warn!(service = %handle.name(), "service_registration_not_acknowledged");
        }

        // Checked after registering: a shutdown that snapshotted the
        // registry before the add has already taken the flag by now.
        if !self.is_ready() {
            tracing::warn!(service = %handle.name(), "service_started_during_shutdown");
            self.stop_service(&handle).await;
            return Err(Error::not_ready("runtime shut down during service start").into());
        }

        tracing::info!(
            service = %handle.name(),
            service_id = %handle.id(),
            trace_id = %ctx.trace_id(),
            "service_started"
        );
        Ok(())
    }

    /// Start several services and wait (bounded by `runtime.await.timeout`)
    /// for all of them to finish starting. A failing start does not stop
    /// the others.
    pub async fn start_services(
        &self,
        services: impl IntoIterator<Item = Arc<dyn Service>>,
    ) -> Result<Vec<ServiceStartup>> {
        let startups = services
            .into_iter()
            .map(|s| self.start_shared(s))
            .collect::<Result<Vec<_>>>()?;
        let tasks: Vec<TaskHandle> = startups.iter().map(|s| s.task.clone()).collect();
        await_all(&tasks, self.inner.config.await_timeout).await;
        Ok(startups)
    }

    /// Stop a ready service. Returns false if it was not ready.
    pub async fn stop_service(&self, handle: &ServiceHandle) -> bool {
        if !handle.cell().transition(ServiceState::Ready, ServiceState::Stopped) {
            return false;
        }

        let ctx = handle.context().clone();
        let unregistered = self
            .broadcast(self.inner.builtin.service_unregister, &ctx, Payload::new(handle.clone()))
            .acknowledged;
        if !unregistered {
            // Listener registry already cleared by shutdown.
            self.inner.services.remove(handle);
        }

        match guard_future(handle.service().stop(&ctx)).await {
            Ok(()) => tracing::info!(service = %handle.name(), "service_stopped"),
            Err(err) => {
                let origin = FailureOrigin::ServiceStop(handle.name().to_string());
                self.escalate(&ctx, Failure::new(origin, Arc::from(err)), Some(handle));
            }
        }
        true
    }

    /// Registered services in registration order.
    pub fn services(&self) -> Vec<ServiceHandle> {
        self.inner.services.snapshot()
    }

    /// First registered service with this name.
    pub fn find_service(&self, name: &str) -> Option<ServiceHandle> {
        self.inner.services.find(name)
    }
}

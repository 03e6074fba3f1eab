//! Kernel - the runtime facade.
//!
//! [`Runtime`] composes the collaborating parts behind one handle:
//! ```text
//!                    ┌──────────────────────────────────────┐
//!   Context ───────► │               Runtime                │
//!                    │  ┌──────────┐  ┌───────────────────┐ │
//!                    │  │ Listener │  │ ServiceRegistry   │ │
//!                    │  │ Registry │  │ (ordered, gated)  │ │
//!                    │  └──────────┘  └───────────────────┘ │
//!                    │  ┌──────────┐  ┌───────────────────┐ │
//!                    │  │ WorkPool │◄─│ SchedulerSet      │ │
//!                    │  │          │  │ + heartbeat sweep │ │
//!                    │  └──────────┘  └───────────────────┘ │
//!                    └──────────────────────────────────────┘
//! ```
//! Channel ids come from the process-wide [`ChannelRegistry`](crate::events::ChannelRegistry).

mod cleanup;
mod dispatch;
mod failure;
pub mod pool;
mod readiness;
mod scheduler;
mod services;
mod shutdown;

pub use cleanup::SweepStats;
pub use failure::{Failure, FailureOrigin};
pub use pool::{await_all, PoolStats, SharedError, TaskHandle, TaskOutcome, WorkPool};
pub use readiness::{ReadyFlag, ServiceState, StateCell};
pub use scheduler::{ScheduleKind, Scheduler};
pub use services::{Service, ServiceHandle, ServiceStartup};
pub use shutdown::wait_for_shutdown_signal;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::events::{
    builtin, channel, ChannelId, ChannelRegistry, Event, HandlerResult, Listener, ListenerRef,
    ListenerRegistry,
};
use crate::observability::{parse_level, Logger};
use crate::types::{Error, Result, RuntimeConfig};
use scheduler::SchedulerSet;
use services::ServiceRegistry;

/// Ids of the channels the runtime listens on itself.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BuiltinChannels {
    pub unhandled: ChannelId,
    pub service_register: ChannelId,
    pub service_unregister: ChannelId,
    pub scheduler_register: ChannelId,
    pub scheduler_unregister: ChannelId,
}

impl BuiltinChannels {
    fn resolve() -> Self {
        Self {
            unhandled: channel(builtin::UNHANDLED),
            service_register: channel(builtin::SERVICE_REGISTER),
            service_unregister: channel(builtin::SERVICE_UNREGISTER),
            scheduler_register: channel(builtin::SCHEDULER_REGISTER),
            scheduler_unregister: channel(builtin::SCHEDULER_UNREGISTER),
        }
    }

    /// Service and scheduler (un)registration channels. Only listeners see
    /// events on these; services are never consulted.
    pub fn is_registration(&self, ch: ChannelId) -> bool {
        ch == self.service_register
            || ch == self.service_unregister
            || ch == self.scheduler_register
            || ch == self.scheduler_unregister
    }
}

/// Shared state behind every [`Runtime`] clone.
pub(crate) struct RuntimeInner {
    pub(crate) config: RuntimeConfig,
    pub(crate) builtin: BuiltinChannels,
    pub(crate) listeners: ListenerRegistry,
    pub(crate) services: ServiceRegistry,
    pub(crate) schedulers: SchedulerSet,
    pub(crate) pool: WorkPool,
    pub(crate) ready: ReadyFlag,
    pub(crate) in_flight: AtomicUsize,
    pub(crate) shutdown_done: watch::Sender<bool>,
    /// Cancelled when teardown begins; stops background loops.
    pub(crate) lifecycle: CancellationToken,
    root: Context,
    started_at: DateTime<Utc>,
}

/// Handle to the runtime kernel. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

/// Snapshot of runtime counters.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub ready: bool,
    pub channels: usize,
    pub listeners: usize,
    pub services: usize,
    pub schedulers: usize,
    pub in_flight: usize,
    pub pool_pending: usize,
    pub pool: PoolStats,
    pub started_at: DateTime<Utc>,
}

/// Builder for [`Runtime`].
#[derive(Debug, Default)]
pub struct RuntimeBuilder {
    entries: Vec<(String, String)>,
    config: Option<RuntimeConfig>,
    handle: Option<Handle>,
}

impl RuntimeBuilder {
    /// Flat configuration entries that become the root context.
    pub fn entries<K, V>(mut self, entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.entries
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.push((key.into(), value.into()));
        self
    }

    /// Use this configuration instead of parsing it from the entries.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Run pooled work on this tokio runtime instead of the current one.
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let handle = match self.handle {
            Some(h) => h,
            None => Handle::try_current()
                .map_err(|e| Error::not_ready(format!("no tokio runtime available: {e}")))?,
        };

        let entries = Context::new(self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let config = match self.config {
            Some(c) => c,
            None => RuntimeConfig::from_context(&entries)?,
        };
        config.validate()?;
        let level = parse_level(&config.log_level);
        let (shutdown_done, _) = watch::channel(false);

        let inner = Arc::new_cyclic(|weak| {
            let logger = Logger::new("runtime", entries.trace_id(), level);
            RuntimeInner {
                root: entries.bind(weak.clone(), logger),
                config,
                builtin: BuiltinChannels::resolve(),
                listeners: ListenerRegistry::new(),
                services: ServiceRegistry::new(),
                schedulers: SchedulerSet::new(),
                pool: WorkPool::new(handle),
                ready: ReadyFlag::new(true),
                in_flight: AtomicUsize::new(0),
                shutdown_done,
                lifecycle: CancellationToken::new(),
                started_at: Utc::now(),
            }
        });

        let runtime = Runtime { inner };
        runtime.install_registration_listeners();
        runtime.spawn_scheduler_sweep();

        tracing::info!(
            trace_id = %runtime.inner.root.trace_id(),
            shutdown_mode = ?runtime.inner.config.shutdown_mode,
            "runtime_started"
        );
        Ok(runtime)
    }
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Runtime on the current tokio runtime with config parsed from no entries.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub(crate) fn from_inner(inner: Arc<RuntimeInner>) -> Self {
        Self { inner }
    }

    /// The root context; derive children from it.
    pub fn context(&self) -> Context {
        self.inner.root.clone()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// False once shutdown has begun.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.is_ready()
    }

    pub fn pool(&self) -> &WorkPool {
        &self.inner.pool
    }

    /// Register (or look up) a channel in the process-wide registry.
    pub fn channel(&self, name: &str) -> ChannelId {
        channel(name)
    }

    pub fn unhandled_channel(&self) -> ChannelId {
        self.inner.builtin.unhandled
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Add a listener; false if this exact listener is already present.
    pub fn add_listener(&self, channel: ChannelId, listener: ListenerRef) -> bool {
        self.inner.listeners.add(channel, listener)
    }

    pub fn remove_listener(&self, channel: ChannelId, listener: &ListenerRef) -> bool {
        self.inner.listeners.remove(channel, listener)
    }

    /// Add a closure listener and return it for later removal.
    pub fn listen<F>(&self, channel: ChannelId, f: F) -> ListenerRef
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        let listener: ListenerRef = Arc::new(f);
        self.inner.listeners.add(channel, listener.clone());
        listener
    }

    pub fn listener_count(&self, channel: ChannelId) -> usize {
        self.inner.listeners.count(channel)
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            ready: self.is_ready(),
            channels: ChannelRegistry::global().len(),
            listeners: self.inner.listeners.total(),
            services: self.inner.services.len(),
            schedulers: self.inner.schedulers.len(),
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
            pool_pending: self.inner.pool.pending(),
            pool: pool::stats(),
            started_at: self.inner.started_at,
        }
    }

    fn install_registration_listeners(&self) {
        let weak = Arc::downgrade(&self.inner);
        let b = self.inner.builtin;
        let listeners = &self.inner.listeners;

        listeners.add(b.service_register, services::register_listener(weak.clone()));
        listeners.add(b.service_unregister, services::unregister_listener(weak.clone()));
        listeners.add(b.scheduler_register, scheduler::register_listener(weak.clone()));
        listeners.add(b.scheduler_unregister, scheduler::unregister_listener(weak));
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("ready", &self.is_ready())
            .field("listeners", &self.inner.listeners)
            .field("services", &self.inner.services.len())
            .field("schedulers", &self.inner.schedulers.len())
            .finish()
    }
}

impl fmt::Debug for RuntimeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeInner")
            .field("ready", &self.ready.is_ready())
            .field("started_at", &self.started_at)
            .finish()
    }
}

/// Listener helper used by the registration channels.
pub(crate) fn payload_listener<T, F>(f: F) -> ListenerRef
where
    T: 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    struct PayloadListener<T, F> {
        f: F,
        _marker: std::marker::PhantomData<fn(&T)>,
    }

    impl<T: 'static, F: Fn(&T) -> bool + Send + Sync> Listener for PayloadListener<T, F> {
        fn on_event(&self, event: &Event) -> HandlerResult {
            match event.payload_as::<T>() {
                Some(value) if (self.f)(value) => Ok(crate::events::Reply::ack()),
                _ => Ok(crate::events::Reply::Pass),
            }
        }
    }

    Arc::new(PayloadListener {
        f,
        _marker: std::marker::PhantomData,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::time::Duration;

    /// Runtime with short timeouts for tests.
    pub fn runtime() -> Runtime {
        runtime_with(RuntimeConfig {
            shutdown_timeout: Duration::from_secs(2),
            scheduler_heartbeat: Duration::from_millis(100),
            await_timeout: Duration::from_secs(2),
            ..RuntimeConfig::default()
        })
    }

    pub fn runtime_with(config: RuntimeConfig) -> Runtime {
        Runtime::builder()
            .entry("app.name", "test")
            .config(config)
            .build()
            .unwrap()
    }
}

//! Propagated execution context.
//!
//! A [`Context`] is an immutable key/value carrier with a [`TraceChain`], an
//! optional [`Logger`] and a non-owning reference to the [`Runtime`].
//! Derivations never touch the parent's storage:
//!
//! ```text
//!   root ──with(k, v)──► same trace, same logger, one more entry
//!        ──child(h)────► entries kept, trace + "h-xxxxxxxx", fresh logger "h"
//!        ──detached(h)─► entries dropped, trace + "h-xxxxxxxx", fresh logger "h"
//! ```

mod trace;

pub use trace::TraceChain;

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::events::{ChannelId, Payload, Response};
use crate::kernel::{Runtime, RuntimeInner, Scheduler, TaskHandle};
use crate::observability::Logger;
use crate::types::{BoxError, Error, Result};

/// One association; newer entries point at older ones.
#[derive(Debug)]
struct Entry {
    key: Arc<str>,
    value: Arc<str>,
    next: Option<Arc<Entry>>,
}

struct ContextInner {
    entries: Option<Arc<Entry>>,
    trace: TraceChain,
    logger: Option<Logger>,
    runtime: Weak<RuntimeInner>,
}

/// Trace-carrying key/value context. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// A root context not bound to any runtime.
    pub fn new<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut head: Option<Arc<Entry>> = None;
        for (k, v) in entries {
            head = Some(Arc::new(Entry {
                key: Arc::from(k.as_ref()),
                value: Arc::from(v.as_ref()),
                next: head,
            }));
        }
        Self {
            inner: Arc::new(ContextInner {
                entries: head,
                trace: TraceChain::new("root"),
                logger: None,
                runtime: Weak::new(),
            }),
        }
    }

    pub fn empty() -> Self {
        Self::new(std::iter::empty::<(&str, &str)>())
    }

    /// Same entries and trace, bound to a runtime with the given logger.
    pub(crate) fn bind(&self, runtime: Weak<RuntimeInner>, logger: Logger) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                entries: self.inner.entries.clone(),
                trace: self.inner.trace.clone(),
                logger: Some(logger),
                runtime,
            }),
        }
    }

    /// Value for `key`; the most recent addition wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        let mut node = self.inner.entries.as_ref();
        while let Some(entry) = node {
            if &*entry.key == key {
                return Some(&entry.value);
            }
            node = entry.next.as_ref();
        }
        None
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Visible entries, each key once, in first-insertion order.
    pub fn entries(&self) -> Vec<(&str, &str)> {
        let mut chain = Vec::new();
        let mut node = self.inner.entries.as_ref();
        while let Some(entry) = node {
            chain.push(entry);
            node = entry.next.as_ref();
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut out = Vec::new();
        for entry in chain.into_iter().rev() {
            let key: &str = &entry.key;
            if seen.insert(key) {
                out.push((key, self.get(key).unwrap_or(&entry.value)));
            }
        }
        out
    }

    /// Copy with one more entry; trace and logger are shared.
    pub fn with(&self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                entries: Some(Arc::new(Entry {
                    key: Arc::from(key.as_ref()),
                    value: Arc::from(value.as_ref()),
                    next: self.inner.entries.clone(),
                })),
                trace: self.inner.trace.clone(),
                logger: self.inner.logger.clone(),
                runtime: self.inner.runtime.clone(),
            }),
        }
    }

    /// Copy-with-addition for a new holder: entries kept, trace extended,
    /// fresh logger named after the holder.
    pub fn child(&self, holder: &str) -> Self {
        self.derive(holder, self.inner.entries.clone())
    }

    /// Copy-with-reset for an async boundary: only the trace chain survives.
    pub fn detached(&self, holder: &str) -> Self {
        self.derive(holder, None)
    }

    fn derive(&self, holder: &str, entries: Option<Arc<Entry>>) -> Self {
        let trace = self.inner.trace.append(holder);
        let logger = self
            .inner
            .logger
            .as_ref()
            .map(|l| l.derive(holder, trace.latest()));
        Self {
            inner: Arc::new(ContextInner {
                entries,
                trace,
                logger,
                runtime: self.inner.runtime.clone(),
            }),
        }
    }

    pub fn trace(&self) -> &TraceChain {
        &self.inner.trace
    }

    /// Newest trace id.
    pub fn trace_id(&self) -> &str {
        self.inner.trace.latest()
    }

    pub fn logger(&self) -> Option<&Logger> {
        self.inner.logger.as_ref()
    }

    /// The runtime this context belongs to, if it is still alive.
    pub fn runtime(&self) -> Option<Runtime> {
        self.inner.runtime.upgrade().map(Runtime::from_inner)
    }

    fn require_runtime(&self) -> Result<Runtime> {
        self.runtime()
            .ok_or_else(|| Error::not_ready("context is not bound to a live runtime"))
    }

    // =========================================================================
    // Runtime shortcuts
    // =========================================================================

    /// Synchronous send; unacknowledged when no runtime is bound.
    pub fn send_event(&self, channel: ChannelId, payload: Payload) -> Response {
        match self.runtime() {
            Some(rt) => rt.send(channel, self, payload),
            None => {
                tracing::warn!(trace = %self.trace(), "send_event on unbound context dropped");
                Response::default()
            }
        }
    }

    pub fn broadcast_event(&self, channel: ChannelId, payload: Payload) -> Response {
        match self.runtime() {
            Some(rt) => rt.broadcast(channel, self, payload),
            None => {
                tracing::warn!(trace = %self.trace(), "broadcast_event on unbound context dropped");
                Response::default()
            }
        }
    }

    /// Asynchronous send; `callback` sees the response at every acknowledgment.
    pub fn send_event_with(
        &self,
        channel: ChannelId,
        payload: Payload,
        broadcast: bool,
        callback: impl Fn(&Response) + Send + Sync + 'static,
    ) -> Result<TaskHandle> {
        Ok(self
            .require_runtime()?
            .send_with(channel, self, payload, broadcast, callback))
    }

    #[track_caller]
    pub fn schedule_once<F, Fut>(&self, delay: Duration, task: F) -> Result<Arc<Scheduler>>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        let location = std::panic::Location::caller();
        self.require_runtime()?
            .schedule_once_at(self, delay, task, location)
    }

    #[track_caller]
    pub fn schedule_periodic<F, Fut, P>(
        &self,
        delay: Duration,
        period: Duration,
        stop: P,
        task: F,
    ) -> Result<Arc<Scheduler>>
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
        P: Fn() -> bool + Send + Sync + 'static,
    {
        let location = std::panic::Location::caller();
        self.require_runtime()?
            .schedule_periodic_at(self, delay, period, stop, task, location)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("trace", &self.inner.trace)
            .field("entries", &self.entries().len())
            .field("bound", &(self.inner.runtime.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lookup_and_shadowing() {
        let ctx = Context::new([("a", "1"), ("b", "2")]);
        let shadowed = ctx.with("a", "10");

        assert_eq!(ctx.get("a"), Some("1"));
        assert_eq!(shadowed.get("a"), Some("10"));
        assert_eq!(shadowed.get("b"), Some("2"));
        assert_eq!(shadowed.get("missing"), None);
        assert_eq!(shadowed.get_or("missing", "dflt"), "dflt");
        assert_eq!(shadowed.entries(), vec![("a", "10"), ("b", "2")]);
    }

    #[test]
    fn test_child_keeps_entries_and_extends_trace() {
        let root = Context::new([("k", "v")]);
        let child = root.child("worker");

        assert_eq!(child.get("k"), Some("v"));
        assert_eq!(child.trace().len(), root.trace().len() + 1);
        assert!(child.trace_id().starts_with("worker-"));
        assert!(child.trace().descends_from(root.trace()));
        // Parent untouched.
        assert_eq!(root.trace().len(), 1);
    }

    #[test]
    fn test_detached_keeps_only_trace() {
        let root = Context::new([("k", "v")]).with("x", "y");
        let detached = root.detached("async");

        assert!(detached.entries().is_empty());
        assert!(detached.trace().descends_from(root.trace()));
        assert_eq!(detached.trace().len(), 2);
    }

    #[test]
    fn test_unbound_context_has_no_runtime() {
        let ctx = Context::empty();
        assert!(ctx.runtime().is_none());
        assert!(ctx.logger().is_none());

        let response = ctx.send_event(ChannelId::INVALID, Payload::empty());
        assert!(!response.acknowledged);

        let err = ctx
            .schedule_once(Duration::from_millis(1), |_| async { Ok::<(), BoxError>(()) })
            .unwrap_err();
        assert!(err.is_not_ready());
    }

    #[test]
    fn test_concurrent_derivations_do_not_interfere() {
        let root = Context::new([("shared", "yes")]);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ctx = root.clone();
                std::thread::spawn(move || {
                    let derived = ctx.child(&format!("t{i}")).with("i", i.to_string());
                    (derived.get("i").map(str::to_string), derived.trace().len())
                })
            })
            .collect();

        for (i, h) in handles.into_iter().enumerate() {
            let (value, len) = h.join().unwrap();
            assert_eq!(value, Some(i.to_string()));
            assert_eq!(len, 2);
        }
        assert_eq!(root.entries(), vec![("shared", "yes")]);
    }
}

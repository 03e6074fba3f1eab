//! Shared work pool and task handles.
//!
//! Every unit of asynchronous work (async sends, service starts, scheduler
//! ticks) is submitted here. The pool is the tokio runtime the kernel was
//! built on plus a [`TaskTracker`] for draining and a token for forced
//! cancellation:
//!
//! ```text
//! submit(fut) ──► TaskTracker::spawn_on ──► select! { cancel token | fut.catch_unwind() }
//!                                                   │
//!                                                   ▼
//!                                     TaskHandle::complete(outcome) ──► callbacks
//! ```
//!
//! Two process-wide counters (active tasks, threads currently polling a
//! pooled task) exist for diagnostics only.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::context::Context;
use crate::types::{panic_message, BoxError, Panicked};

/// Error shared between every observer of a failed task.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

// =============================================================================
// Global counters
// =============================================================================

static ACTIVE_TASKS: AtomicUsize = AtomicUsize::new(0);
static ACTIVE_CARRIERS: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CARRIER_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Snapshot of the global task counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Pooled tasks submitted and not yet finished.
    pub active_tasks: usize,
    /// OS threads currently polling a pooled task.
    pub active_carriers: usize,
}

pub fn stats() -> PoolStats {
    PoolStats {
        active_tasks: ACTIVE_TASKS.load(Ordering::Relaxed),
        active_carriers: ACTIVE_CARRIERS.load(Ordering::Relaxed),
    }
}

struct CarrierGuard;

impl CarrierGuard {
    fn enter() -> Self {
        CARRIER_DEPTH.with(|depth| {
            if depth.get() == 0 {
                ACTIVE_CARRIERS.fetch_add(1, Ordering::Relaxed);
            }
            depth.set(depth.get() + 1);
        });
        CarrierGuard
    }
}

impl Drop for CarrierGuard {
    fn drop(&mut self) {
        CARRIER_DEPTH.with(|depth| {
            depth.set(depth.get().saturating_sub(1));
            if depth.get() == 0 {
                ACTIVE_CARRIERS.fetch_sub(1, Ordering::Relaxed);
            }
        });
    }
}

/// Counts the polling thread as a carrier for the duration of each poll.
struct Carried<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for Carried<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let _carrier = CarrierGuard::enter();
        self.inner.as_mut().poll(cx)
    }
}

// =============================================================================
// Task handle
// =============================================================================

/// How a pooled task ended.
#[derive(Clone)]
pub enum TaskOutcome {
    Completed,
    Failed(SharedError),
    /// Force-cancelled by pool shutdown, or dropped by the executor.
    Cancelled,
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed)
    }

    pub fn error(&self) -> Option<&SharedError> {
        match self {
            TaskOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Debug for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Completed => write!(f, "Completed"),
            TaskOutcome::Failed(err) => write!(f, "Failed({err})"),
            TaskOutcome::Cancelled => write!(f, "Cancelled"),
        }
    }
}

type CompletionCallback = Box<dyn FnOnce(&TaskOutcome) + Send>;

#[derive(Default)]
struct Slot {
    outcome: Option<TaskOutcome>,
    callbacks: Vec<CompletionCallback>,
}

struct TaskState {
    name: Arc<str>,
    slot: Mutex<Slot>,
    done: watch::Sender<bool>,
    observed: AtomicBool,
    context: Option<Context>,
}

/// Handle to one unit of pooled work.
///
/// Callbacks registered with [`on_complete`](Self::on_complete) fire once,
/// immediately if the task already finished. A failure nobody observed is
/// logged through the bound context's logger.
#[derive(Clone)]
pub struct TaskHandle {
    state: Arc<TaskState>,
}

impl TaskHandle {
    fn new(name: &str, context: Option<Context>, observed: bool) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            state: Arc::new(TaskState {
                name: Arc::from(name),
                slot: Mutex::new(Slot::default()),
                done,
                observed: AtomicBool::new(observed),
                context,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn is_finished(&self) -> bool {
        self.state.slot.lock().outcome.is_some()
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.state.slot.lock().outcome.clone()
    }

    pub fn on_complete(&self, callback: impl FnOnce(&TaskOutcome) + Send + 'static) {
        let mut slot = self.state.slot.lock();
        match slot.outcome.clone() {
            Some(outcome) => {
                drop(slot);
                run_callback(&self.state.name, Box::new(callback), &outcome);
            }
            None => slot.callbacks.push(Box::new(callback)),
        }
    }

    /// Wait for the outcome. Marks failures as observed.
    pub async fn join(&self) -> TaskOutcome {
        self.state.observed.store(true, Ordering::Release);
        self.wait().await;
        self.outcome().unwrap_or(TaskOutcome::Cancelled)
    }

    /// Wait without taking responsibility for the outcome.
    pub(crate) async fn wait(&self) {
        let mut rx = self.state.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    fn complete(&self, outcome: TaskOutcome) {
        let callbacks = {
            let mut slot = self.state.slot.lock();
            if slot.outcome.is_some() {
                return;
            }
            slot.outcome = Some(outcome.clone());
            std::mem::take(&mut slot.callbacks)
        };

        if callbacks.is_empty() && !self.state.observed.load(Ordering::Acquire) {
            if let TaskOutcome::Failed(err) = &outcome {
                self.log_unobserved(err);
            }
        }
        for callback in callbacks {
            run_callback(&self.state.name, callback, &outcome);
        }
        self.state.done.send_replace(true);
    }

    fn log_unobserved(&self, err: &SharedError) {
        let name = self.state.name.clone();
        match self.state.context.as_ref().and_then(Context::logger) {
            Some(logger) => logger.error_with_error(err.as_ref(), || format!("task {name} failed")),
            None => tracing::error!(task = %name, error = %err, "task_failed"),
        }
    }
}

fn run_callback(name: &str, callback: CompletionCallback, outcome: &TaskOutcome) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(outcome))) {
        tracing::error!(
            task = %name,
            panic = %panic_message(panic.as_ref()),
            "task_completion_callback_panicked"
        );
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.state.name)
            .field("outcome", &self.outcome())
            .finish()
    }
}

/// Decrements the active counter and settles the handle if the future is
/// dropped before finishing.
struct TaskGuard {
    task: TaskHandle,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        ACTIVE_TASKS.fetch_sub(1, Ordering::Relaxed);
        self.task.complete(TaskOutcome::Cancelled);
    }
}

// =============================================================================
// Work pool
// =============================================================================

/// The shared pool all kernel work runs on.
#[derive(Clone)]
pub struct WorkPool {
    handle: Handle,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl WorkPool {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Tasks currently tracked by this pool.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Run `fut` on the pool. Panics and errors become the task outcome.
    pub fn submit<F>(&self, name: &str, context: Option<Context>, fut: F) -> TaskHandle
    where
        F: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.spawn(TaskHandle::new(name, context, false), fut)
    }

    /// Like [`submit`](Self::submit) for work whose failures the kernel has
    /// already escalated; the outcome is never logged as unobserved.
    pub(crate) fn submit_escalated<F>(&self, name: &str, context: Option<Context>, fut: F) -> TaskHandle
    where
        F: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.spawn(TaskHandle::new(name, context, true), fut)
    }

    fn spawn<F>(&self, task: TaskHandle, fut: F) -> TaskHandle
    where
        F: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        ACTIVE_TASKS.fetch_add(1, Ordering::Relaxed);
        let guard = TaskGuard { task: task.clone() };
        let cancel = self.cancel.clone();

        self.tracker.spawn_on(
            async move {
                let guard = guard;
                let body = Carried {
                    inner: Box::pin(AssertUnwindSafe(fut).catch_unwind()),
                };
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => TaskOutcome::Cancelled,
                    result = body => match result {
                        Ok(Ok(())) => TaskOutcome::Completed,
                        Ok(Err(err)) => TaskOutcome::Failed(Arc::from(err)),
                        Err(panic) => TaskOutcome::Failed(Arc::from(Panicked::boxed(panic.as_ref()))),
                    },
                };
                guard.task.complete(outcome);
            },
            &self.handle,
        );
        task
    }

    /// Stop accepting the pool as busy: wait up to `grace` for tracked work,
    /// then force-cancel whatever is left. Returns true on a clean drain.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            return true;
        }

        tracing::warn!(
            pending = self.tracker.len(),
            grace_ms = grace.as_millis() as u64,
            "work_pool_grace_exceeded_cancelling"
        );
        self.cancel.cancel();
        let _ = tokio::time::timeout(grace, self.tracker.wait()).await;
        false
    }
}

impl fmt::Debug for WorkPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkPool")
            .field("pending", &self.tracker.len())
            .field("closed", &self.tracker.is_closed())
            .finish()
    }
}

/// Countdown wait for a batch of tasks.
///
/// Gives up after `timeout`, logging how many were still running, and
/// returns false. Never fails.
pub async fn await_all(tasks: &[TaskHandle], timeout: Duration) -> bool {
    let all = futures::future::join_all(tasks.iter().map(TaskHandle::wait));
    match tokio::time::timeout(timeout, all).await {
        Ok(_) => true,
        Err(_) => {
            let pending = tasks.iter().filter(|t| !t.is_finished()).count();
            tracing::warn!(
                pending,
                total = tasks.len(),
                timeout_ms = timeout.as_millis() as u64,
                "await_all_timed_out"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn pool() -> WorkPool {
        WorkPool::new(Handle::current())
    }

    #[tokio::test]
    async fn test_submit_completes() {
        let pool = pool();
        let task = pool.submit("ok", None, async { Ok::<(), BoxError>(()) });
        assert!(task.join().await.is_completed());
        assert!(task.is_finished());
    }

    #[tokio::test]
    async fn test_failure_and_panic_become_outcomes() {
        let pool = pool();
        let failed = pool.submit("fail", None, async { Err::<(), BoxError>("nope".into()) });
        let outcome = failed.join().await;
        assert_eq!(outcome.error().map(|e| e.to_string()), Some("nope".to_string()));

        let panicked = pool.submit("panic", None, async {
            if true {
                panic!("kaboom");
            }
            Ok::<(), BoxError>(())
        });
        let outcome = panicked.join().await;
        assert!(outcome.error().unwrap().to_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_callbacks_fire_once_even_when_late() {
        let pool = pool();
        let calls = Arc::new(AtomicUsize::new(0));

        let task = pool.submit("cb", None, async { Ok::<(), BoxError>(()) });
        let c = calls.clone();
        task.on_complete(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        task.join().await;

        // Registered after completion: fires immediately.
        let c = calls.clone();
        task.on_complete(move |outcome| {
            assert!(outcome.is_completed());
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_all_gives_up_after_timeout() {
        let pool = pool();
        let fast = pool.submit("fast", None, async { Ok::<(), BoxError>(()) });
        let slow = pool.submit("slow", None, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<(), BoxError>(())
        });

        assert!(!await_all(&[fast.clone(), slow.clone()], Duration::from_secs(1)).await);
        assert!(fast.is_finished());
        assert!(!slow.is_finished());
        assert!(await_all(&[fast], Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_force_cancels_stragglers() {
        let pool = pool();
        let stuck = pool.submit("stuck", None, async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<(), BoxError>(())
        });

        let graceful = pool.shutdown(Duration::from_millis(100)).await;
        assert!(!graceful);
        assert!(matches!(stuck.join().await, TaskOutcome::Cancelled));
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_cleanly() {
        let pool = pool();
        let task = pool.submit("quick", None, async {
            tokio::task::yield_now().await;
            Ok::<(), BoxError>(())
        });
        assert!(pool.shutdown(Duration::from_secs(5)).await);
        assert!(task.outcome().unwrap().is_completed());
    }

    #[tokio::test]
    async fn test_counters_track_active_tasks() {
        let pool = pool();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = pool.submit("held", None, async move {
            let _ = rx.await;
            Ok::<(), BoxError>(())
        });
        assert!(stats().active_tasks >= 1);
        let _ = tx.send(());
        task.join().await;
    }
}

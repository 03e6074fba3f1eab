//! Delayed and periodic work.
//!
//! A scheduler's timer never runs the task body. It sleeps, then forwards
//! the task into the [`WorkPool`](super::WorkPool) and waits for that tick
//! to finish before arming again (fixed delay):
//!
//! ```text
//! register ──► [stop?] ──► sleep ──► pool.submit(task) ──► wait ──┐
//!                 ▲                                               │
//!                 └───────────────────────────────────────────────┘
//!              stop() == true ──► unregister
//! ```
//!
//! Schedulers register and unregister through the scheduler channels. One
//! terminated without unregistering is picked up by the heartbeat sweep.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::dispatch::{guard_call, guard_future};
use super::failure::{Escalated, Failure, FailureOrigin};
use super::pool::{SharedError, TaskHandle};
use super::{payload_listener, Runtime, RuntimeInner};
use crate::context::Context;
use crate::events::{ListenerRef, Payload};
use crate::types::{BoxError, Error, Result, SchedulerId};

/// What a scheduler was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleKind {
    Once {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    Periodic {
        #[serde(with = "humantime_serde")]
        delay: Duration,
        #[serde(with = "humantime_serde")]
        period: Duration,
    },
}

/// A registered timer.
pub struct Scheduler {
    id: SchedulerId,
    kind: ScheduleKind,
    created_at: DateTime<Utc>,
    token: CancellationToken,
    unregistered: AtomicBool,
    ticks: AtomicU64,
}

impl Scheduler {
    fn new(id: SchedulerId, kind: ScheduleKind) -> Self {
        Self {
            id,
            kind,
            created_at: Utc::now(),
            token: CancellationToken::new(),
            unregistered: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &SchedulerId {
        &self.id
    }

    pub fn kind(&self) -> ScheduleKind {
        self.kind
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Ticks forwarded to the pool so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Stop the timer without unregistering. A tick already forwarded to
    /// the pool runs to completion.
    pub fn terminate(&self) {
        self.token.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_unregistered(&self) -> bool {
        self.unregistered.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("ticks", &self.ticks())
            .field("terminated", &self.is_terminated())
            .field("unregistered", &self.is_unregistered())
            .finish()
    }
}

/// Live schedulers by id.
#[derive(Default)]
pub(crate) struct SchedulerSet {
    schedulers: RwLock<HashMap<SchedulerId, Arc<Scheduler>>>,
}

impl SchedulerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, scheduler: Arc<Scheduler>) -> bool {
        self.schedulers
            .write()
            .insert(scheduler.id.clone(), scheduler)
            .is_none()
    }

    pub fn remove(&self, id: &SchedulerId) -> bool {
        self.schedulers.write().remove(id).is_some()
    }

    pub fn snapshot(&self) -> Vec<Arc<Scheduler>> {
        self.schedulers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.schedulers.read().len()
    }

    pub fn clear(&self) {
        self.schedulers.write().clear();
    }
}

pub(crate) fn register_listener(runtime: Weak<RuntimeInner>) -> ListenerRef {
    payload_listener::<Arc<Scheduler>, _>(move |scheduler: &Arc<Scheduler>| {
        runtime
            .upgrade()
            .is_some_and(|inner| inner.schedulers.add(scheduler.clone()))
    })
}

pub(crate) fn unregister_listener(runtime: Weak<RuntimeInner>) -> ListenerRef {
    payload_listener::<Arc<Scheduler>, _>(move |scheduler: &Arc<Scheduler>| {
        runtime
            .upgrade()
            .is_some_and(|inner| inner.schedulers.remove(&scheduler.id))
    })
}

impl Runtime {
    /// Run `task` once after `delay` on the work pool.
    #[track_caller]
    pub fn schedule_once<F, Fut>(&self, delay: Duration, task: F) -> Result<Arc<Scheduler>>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.schedule_once_at(&self.inner.root, delay, task, Location::caller())
    }

    /// Run `task` after `delay`, then every `period` after the previous tick
    /// finished, until `stop` returns true. `stop` is checked before every
    /// tick.
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
        self.schedule_periodic_at(&self.inner.root, delay, period, stop, task, Location::caller())
    }

    pub(crate) fn schedule_once_at<F, Fut>(
        &self,
        ctx: &Context,
        delay: Duration,
        task: F,
        location: &'static Location<'static>,
    ) -> Result<Arc<Scheduler>>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        let (scheduler, ctx) = self.new_scheduler(ctx, ScheduleKind::Once { delay }, location)?;
        let weak = Arc::downgrade(&self.inner);
        let s = scheduler.clone();

        self.inner.pool.handle().spawn(async move {
            tokio::select! {
                biased;
                _ = s.token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(runtime) = weak.upgrade().map(Runtime::from_inner) else {
                return;
            };
            let tick = runtime.forward_tick(&s, &ctx, task);
            tick.wait().await;
            runtime.unregister_scheduler(&ctx, &s);
        });

        Ok(scheduler)
    }

    pub(crate) fn schedule_periodic_at<F, Fut, P>(
        &self,
        ctx: &Context,
        delay: Duration,
        period: Duration,
        stop: P,
        task: F,
        location: &'static Location<'static>,
    ) -> Result<Arc<Scheduler>>
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
        P: Fn() -> bool + Send + Sync + 'static,
    {
        if period.is_zero() {
            return Err(Error::validation("periodic schedule needs a non-zero period"));
        }
        let kind = ScheduleKind::Periodic { delay, period };
        let (scheduler, ctx) = self.new_scheduler(ctx, kind, location)?;
        let weak = Arc::downgrade(&self.inner);
        let s = scheduler.clone();
        let task = Arc::new(task);

        self.inner.pool.handle().spawn(async move {
            let mut wait = delay;
            loop {
                let Some(runtime) = weak.upgrade().map(Runtime::from_inner) else {
                    return;
                };
                match guard_call(|| Ok(stop())) {
                    Ok(false) => {}
                    Ok(true) => {
                        runtime.unregister_scheduler(&ctx, &s);
                        return;
                    }
                    Err(err) => {
                        let origin = FailureOrigin::Scheduler(s.id.clone());
                        runtime.escalate(&ctx, Failure::new(origin, Arc::from(err)), None);
                        runtime.unregister_scheduler(&ctx, &s);
                        return;
                    }
                }
                drop(runtime);

                tokio::select! {
                    biased;
                    _ = s.token.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
                let Some(runtime) = weak.upgrade().map(Runtime::from_inner) else {
                    return;
                };
                let task = task.clone();
                let tick = runtime.forward_tick(&s, &ctx, move |c| task(c));
                drop(runtime);

                tokio::select! {
                    biased;
                    _ = s.token.cancelled() => return,
                    _ = tick.wait() => {}
                }
                wait = period;
            }
        });

        Ok(scheduler)
    }

    /// Live schedulers, in no particular order.
    pub fn schedulers(&self) -> Vec<Arc<Scheduler>> {
        self.inner.schedulers.snapshot()
    }

    fn new_scheduler(
        &self,
        ctx: &Context,
        kind: ScheduleKind,
        location: &'static Location<'static>,
    ) -> Result<(Arc<Scheduler>, Context)> {
        if !self.is_ready() {
            return Err(Error::not_ready("cannot schedule work: runtime is shutting down"));
        }
        let scheduler = Arc::new(Scheduler::new(SchedulerId::at(location), kind));
        let ctx = ctx.child("scheduler");
        self.broadcast(
            self.inner.builtin.scheduler_register,
            &ctx,
            Payload::new(scheduler.clone()),
        );
        tracing::debug!(scheduler = %scheduler.id, kind = ?kind, "scheduler_registered");
        Ok((scheduler, ctx))
    }

    /// Hand one tick to the pool. Failures escalate tagged with the
    /// scheduler and never end the schedule.
    fn forward_tick<F, Fut>(&self, scheduler: &Arc<Scheduler>, ctx: &Context, task: F) -> TaskHandle
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        scheduler.ticks.fetch_add(1, Ordering::Relaxed);
        let tick_ctx = ctx.child("tick");
        let runtime = self.clone();
        let id = scheduler.id.clone();
        let name = id.to_string();

        self.inner.pool.submit_escalated(
            &name,
            Some(tick_ctx.clone()),
            async move {
                let result = match guard_call(|| Ok(task(tick_ctx.clone()))) {
                    Ok(fut) => guard_future(fut).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = result {
                    let err: SharedError = Arc::from(err);
                    let failure = Failure::new(FailureOrigin::Scheduler(id), err.clone());
                    runtime.escalate(&tick_ctx, failure, None);
                    return Err(Box::new(Escalated(err)) as BoxError);
                }
                Ok(())
            },
        )
    }

    pub(crate) fn unregister_scheduler(&self, ctx: &Context, scheduler: &Arc<Scheduler>) -> bool {
        if scheduler.unregistered.swap(true, Ordering::AcqRel) {
            return false;
        }
        scheduler.token.cancel();
        self.broadcast(
            self.inner.builtin.scheduler_unregister,
            ctx,
            Payload::new(scheduler.clone()),
        );
        tracing::debug!(scheduler = %scheduler.id, ticks = scheduler.ticks(), "scheduler_unregistered");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{runtime, runtime_with};
    use super::*;
    use crate::events::{Event, HandlerResult, Reply};
    use crate::types::RuntimeConfig;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_once_runs_after_delay_and_unregisters() {
        let rt = runtime();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let scheduler = rt
            .schedule_once(Duration::from_secs(5), move |_| async move {
                r.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            })
            .unwrap();

        assert_eq!(rt.schedulers().len(), 1);
        assert!(scheduler.id().as_str().starts_with("scheduler.rs:"));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_unregistered());
        assert!(rt.schedulers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_stops_on_predicate() {
        let rt = runtime();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let stop_count = count.clone();

        let scheduler = rt
            .schedule_periodic(
                Duration::from_millis(10),
                Duration::from_millis(10),
                move || stop_count.load(Ordering::SeqCst) >= 3,
                move |_| {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), BoxError>(())
                    }
                },
            )
            .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.ticks(), 3);
        assert!(scheduler.is_unregistered());
        assert!(rt.schedulers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_failure_escalates_without_ending_schedule() {
        let rt = runtime();
        let failures = Arc::new(AtomicUsize::new(0));
        let f = failures.clone();
        rt.listen(rt.unhandled_channel(), move |event: &Event| -> HandlerResult {
            if let Some(failure) = event.payload_as::<Failure>() {
                assert!(matches!(failure.origin, FailureOrigin::Scheduler(_)));
                f.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Reply::ack())
        });

        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();
        let stop_ticks = ticks.clone();
        rt.schedule_periodic(
            Duration::ZERO,
            Duration::from_millis(5),
            move || stop_ticks.load(Ordering::SeqCst) >= 2,
            move |_| {
                let t = t.clone();
                async move {
                    t.fetch_add(1, Ordering::SeqCst);
                    Err::<(), BoxError>("tick failed".into())
                }
            },
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert_eq!(failures.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_stops_timer_but_keeps_registration() {
        // Heartbeat far beyond the test so the sweep cannot interfere.
        let rt = runtime_with(RuntimeConfig {
            scheduler_heartbeat: Duration::from_secs(3600),
            ..RuntimeConfig::default()
        });
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let scheduler = rt
            .schedule_once(Duration::from_secs(1), move |_| async move {
                r.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            })
            .unwrap();

        scheduler.terminate();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(scheduler.is_terminated());
        assert!(!scheduler.is_unregistered());
    }

    #[tokio::test]
    async fn test_zero_period_is_rejected() {
        let rt = runtime();
        let err = rt
            .schedule_periodic(Duration::ZERO, Duration::ZERO, || false, |_| async { Ok::<(), BoxError>(()) })
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(rt.schedulers().is_empty());
    }

    #[tokio::test]
    async fn test_register_event_carries_scheduler() {
        let rt = runtime();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        rt.listen(
            rt.channel(crate::events::builtin::SCHEDULER_REGISTER),
            move |event: &Event| -> HandlerResult {
                assert!(event.payload_as::<Arc<Scheduler>>().is_some());
                s.fetch_add(1, Ordering::SeqCst);
                Ok(Reply::Pass)
            },
        );

        let scheduler = rt
            .schedule_once(Duration::from_secs(3600), |_| async { Ok::<(), BoxError>(()) })
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        scheduler.terminate();
    }
}

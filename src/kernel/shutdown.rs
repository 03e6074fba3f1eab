//! Shutdown protocol.
//!
//! ```text
//! shutdown() ── ready.take() ──┬─ first caller ──► spawn control task
//!                              └─ everyone ──────► wait for completion
//!
//! control task:
//!   1. readiness already false; background loops stopped
//!   2. services   sequential LIFO or parallel      (≤ shutdown timeout, then
//!                 the rest are marked stopped and unregistered)
//!   3. schedulers terminated, work pool drained    (≤ shutdown timeout, then force-cancel)
//!   4. listener registry cleared
//!   5. scheduler set cleared
//! ```
//!
//! The teardown runs on its own task, so a caller that gives up waiting
//! (or is cancelled) cannot abandon it midway.

use tokio::time::Instant;

use super::{Runtime, ServiceState};
use crate::events::Payload;
use crate::types::ShutdownMode;

impl Runtime {
    /// Shut the runtime down. Idempotent: every call, concurrent or later,
    /// returns once the single teardown has finished.
    pub async fn shutdown(&self) {
        if self.inner.ready.take() {
            let runtime = self.clone();
            self.inner.pool.handle().spawn(async move {
                runtime.teardown().await;
                runtime.inner.shutdown_done.send_replace(true);
            });
        }
        self.wait_for_shutdown().await;
    }

    /// Wait until a shutdown started elsewhere has completed.
    pub async fn wait_for_shutdown(&self) {
        let mut done = self.inner.shutdown_done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown_done.borrow()
    }

    /// Wait for SIGINT, SIGTERM or SIGQUIT (Ctrl-C elsewhere), then shut
    /// down.
    pub async fn run_until_signal(&self) -> std::io::Result<()> {
        tokio::select! {
            signal = wait_for_shutdown_signal() => {
                signal?;
                tracing::info!("shutdown_signal_received");
            }
            _ = self.wait_for_shutdown() => return Ok(()),
        }
        self.shutdown().await;
        Ok(())
    }

    async fn teardown(&self) {
        let started = Instant::now();
        let timeout = self.inner.config.shutdown_timeout;
        tracing::info!(
            mode = ?self.inner.config.shutdown_mode,
            timeout_ms = timeout.as_millis() as u64,
            "runtime_shutdown_started"
        );
        self.inner.lifecycle.cancel();

        // Stage 2: services.
        if tokio::time::timeout(timeout, self.stop_all_services()).await.is_err() {
            let abandoned = self.abandon_services();
            tracing::warn!(
                abandoned = ?abandoned,
                timeout_ms = timeout.as_millis() as u64,
                "service_shutdown_timed_out"
            );
        }

        // Stage 3: schedulers and the pool.
        for scheduler in self.inner.schedulers.snapshot() {
            scheduler.terminate();
        }
        let drained = self.inner.pool.shutdown(timeout).await;

        // Stages 4 and 5.
        self.inner.listeners.clear();
        self.inner.schedulers.clear();

        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            pool_drained = drained,
            "runtime_shutdown_complete"
        );
    }

    /// Mark every service still registered as stopped and drop it from the
    /// registry without calling `stop()`. Returns their names.
    fn abandon_services(&self) -> Vec<String> {
        let ctx = self.inner.root.child("shutdown");
        let mut abandoned = Vec::new();
        for service in self.inner.services.snapshot() {
            service.cell().transition(ServiceState::Ready, ServiceState::Stopped);
            self.broadcast(
                self.inner.builtin.service_unregister,
                &ctx,
                Payload::new(service.clone()),
            );
            self.inner.services.remove(&service);
            abandoned.push(service.name().to_string());
        }
        abandoned
    }

    async fn stop_all_services(&self) {
        let services = self.inner.services.snapshot();
        match self.inner.config.shutdown_mode {
            ShutdownMode::Sequential => {
                for service in services.iter().rev() {
                    self.stop_service(service).await;
                }
            }
            ShutdownMode::Parallel => {
                futures::future::join_all(services.iter().map(|s| self.stop_service(s))).await;
            }
        }
    }
}

/// Completes when the process receives a termination signal.
///
/// Each call installs independent signal listeners.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{runtime, runtime_with};
    use super::super::Service;
    use super::*;
    use crate::context::Context;
    use crate::events::{channel, Event, HandlerResult, Payload, Reply};
    use crate::types::{BoxError, RuntimeConfig};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Slow {
        name: String,
        stop_for: Duration,
        order: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Service for Slow {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&self, _ctx: &Context) -> Result<(), BoxError> {
            Ok(())
        }

        async fn stop(&self, _ctx: &Context) -> Result<(), BoxError> {
            tokio::time::sleep(self.stop_for).await;
            self.order.lock().push(self.name.clone());
            Ok(())
        }
    }

    async fn start_slow(rt: &Runtime, durations: &[u64]) -> Arc<Mutex<Vec<String>>> {
        let order = Arc::new(Mutex::new(Vec::new()));
        for (i, ms) in durations.iter().enumerate() {
            let startup = rt
                .start_service(Slow {
                    name: format!("svc{i}"),
                    stop_for: Duration::from_millis(*ms),
                    order: order.clone(),
                })
                .unwrap();
            startup.task.join().await;
        }
        order
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_shutdown_is_lifo() {
        let rt = runtime();
        let order = start_slow(&rt, &[10, 10, 10]).await;

        rt.shutdown().await;
        assert_eq!(*order.lock(), vec!["svc2", "svc1", "svc0"]);
        assert!(rt.services().is_empty());
        assert!(!rt.is_ready());
        assert!(rt.is_shut_down());
    }

    /// Acknowledges every event and takes far longer to stop than allowed.
    struct Stubborn {
        name: &'static str,
    }

    #[async_trait]
    impl Service for Stubborn {
        fn name(&self) -> &str {
            self.name
        }

        async fn start(&self, _ctx: &Context) -> Result<(), BoxError> {
            Ok(())
        }

        async fn stop(&self, _ctx: &Context) -> Result<(), BoxError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }

        fn on_event(&self, _event: &Event) -> HandlerResult {
            Ok(Reply::ack())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_services_past_the_timeout_are_abandoned() {
        let rt = runtime_with(RuntimeConfig {
            shutdown_timeout: Duration::from_millis(100),
            ..RuntimeConfig::default()
        });
        let mut handles = Vec::new();
        for name in ["a", "b"] {
            let startup = rt.start_service(Stubborn { name }).unwrap();
            startup.task.join().await;
            handles.push(startup.service);
        }
        let ch = channel("shutdown.test.abandoned");
        assert!(rt.send(ch, &rt.context(), Payload::empty()).acknowledged);

        let started = Instant::now();
        rt.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(rt.services().is_empty());
        assert!(handles.iter().all(|h| h.state() == ServiceState::Stopped));
        assert!(!rt.send(ch, &rt.context(), Payload::empty()).acknowledged);
    }

    /// `start()` waits for a release signal.
    struct Gated {
        release: Arc<Notify>,
        stopped: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Service for Gated {
        fn name(&self) -> &str {
            "gated"
        }

        async fn start(&self, _ctx: &Context) -> Result<(), BoxError> {
            self.release.notified().await;
            Ok(())
        }

        async fn stop(&self, _ctx: &Context) -> Result<(), BoxError> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_service_finishing_start_during_shutdown_is_stopped() {
        let rt = runtime();
        let release = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicUsize::new(0));
        let startup = rt
            .start_service(Gated {
                release: release.clone(),
                stopped: stopped.clone(),
            })
            .unwrap();

        let shutting = {
            let rt = rt.clone();
            tokio::spawn(async move { rt.shutdown().await })
        };
        while rt.is_ready() {
            tokio::task::yield_now().await;
        }
        release.notify_one();
        shutting.await.unwrap();

        assert!(startup.task.join().await.error().is_some());
        assert_eq!(startup.service.state(), ServiceState::Stopped);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(rt.services().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_shutdown_takes_the_longest_stop() {
        let rt = runtime_with(
            RuntimeConfig {
                shutdown_timeout: Duration::from_secs(5),
                ..RuntimeConfig::default()
            }
            .with_shutdown_mode(ShutdownMode::Parallel),
        );
        start_slow(&rt, &[100, 200, 300, 400]).await;

        let started = Instant::now();
        rt.shutdown().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(400));
        assert!(elapsed < Duration::from_millis(1000), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_concurrent_shutdown_tears_down_once() {
        let rt = runtime();
        let unregistered = Arc::new(AtomicUsize::new(0));
        let u = unregistered.clone();
        rt.listen(
            channel(crate::events::builtin::SERVICE_UNREGISTER),
            move |_: &Event| -> HandlerResult {
                u.fetch_add(1, Ordering::SeqCst);
                Ok(Reply::Pass)
            },
        );
        start_slow(&rt, &[20]).await;

        tokio::join!(rt.shutdown(), rt.shutdown(), rt.shutdown());
        rt.shutdown().await;

        assert_eq!(unregistered.load(Ordering::SeqCst), 1);
        assert!(rt.is_shut_down());
    }

    #[tokio::test]
    async fn test_work_refused_after_shutdown() {
        let rt = runtime();
        let ch = channel("shutdown.test.cleared");
        rt.listen(ch, |_: &Event| -> HandlerResult { Ok(Reply::ack()) });
        rt.shutdown().await;

        assert_eq!(rt.listener_count(ch), 0);
        assert!(!rt.send(ch, &rt.context(), Payload::empty()).acknowledged);
        let err = rt
            .schedule_once(Duration::from_millis(1), |_| async {
                Ok::<(), BoxError>(())
            })
            .unwrap_err();
        assert!(err.is_not_ready());
        assert!(rt
            .start_service(Slow {
                name: "late".into(),
                stop_for: Duration::ZERO,
                order: Arc::default(),
            })
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedulers_terminated_on_shutdown() {
        let rt = runtime();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let stop_runs = runs.clone();
        let scheduler = rt
            .schedule_periodic(
                Duration::from_millis(10),
                Duration::from_millis(10),
                move || stop_runs.load(Ordering::SeqCst) > 1000,
                move |_| {
                    let r = r.clone();
                    async move {
                        r.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), BoxError>(())
                    }
                },
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(55)).await;
        rt.shutdown().await;
        let after = runs.load(Ordering::SeqCst);
        assert!(after >= 1);
        assert!(scheduler.is_terminated());
        assert!(rt.schedulers().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after);
    }
}

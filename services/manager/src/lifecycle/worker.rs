//! Maintenance worker.
//!
//! One worker per managed infrastructure. It runs reconciliation passes at a
//! fixed interval until it is told to stop; a failed pass is logged and
//! retried on the next tick, it never ends the loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use infravisor_id::InfraId;
use infravisor_reconcile::{PassReport, ProcessStrategy, ReconcileError, Reconciler};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Lifecycle state of a maintenance worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Running,

    /// The worker saw the stop signal and is winding down.
    TerminationRequested,

    /// The supervisor has reaped the worker.
    Terminated,
}

/// Statistics shared between a worker and its supervisor.
#[derive(Debug)]
pub struct WorkerStats {
    state: Mutex<WorkerState>,
    passes: AtomicU64,
    failures: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_pass_at: Mutex<Option<DateTime<Utc>>>,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self {
            state: Mutex::new(WorkerState::Running),
            passes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_error: Mutex::new(None),
            last_pass_at: Mutex::new(None),
        }
    }
}

impl WorkerStats {
    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Successful passes so far.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    /// Failed passes so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_pass_at(&self) -> Option<DateTime<Utc>> {
        *self
            .last_pass_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, result: &Result<PassReport, ReconcileError>) {
        *self
            .last_pass_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        let mut last_error = self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(_) => {
                self.passes.fetch_add(1, Ordering::SeqCst);
                *last_error = None;
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                *last_error = Some(e.to_string());
            }
        }
    }
}

/// The reconcile-then-sleep loop for one infrastructure.
pub struct MaintenanceWorker {
    infra_id: InfraId,
    interval: Duration,
    strategy: ProcessStrategy,
    reconciler: Box<dyn Reconciler>,
    stats: Arc<WorkerStats>,
}

impl MaintenanceWorker {
    pub fn new(
        infra_id: InfraId,
        interval: Duration,
        strategy: ProcessStrategy,
        reconciler: Box<dyn Reconciler>,
        stats: Arc<WorkerStats>,
    ) -> Self {
        Self {
            infra_id,
            interval,
            strategy,
            reconciler,
            stats,
        }
    }

    /// Run until `stop` turns true or its sender is dropped.
    ///
    /// A stop that arrives mid-pass asks the reconciler to cancel its pending
    /// operations and then waits for the pass to finish, so whatever the pass
    /// already provisioned is recorded in the store. The sleep between passes
    /// is simply abandoned.
    #[instrument(skip(self, stop), fields(infra_id = %self.infra_id))]
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            strategy = %self.strategy,
            "Starting maintenance worker"
        );

        loop {
            let mut pass = self.reconciler.reconcile(self.infra_id);
            let stopped = tokio::select! {
                biased;
                result = &mut pass => {
                    self.report_pass(result);
                    false
                }
                _ = stop_requested(&mut stop) => true,
            };

            if stopped {
                self.stats.set_state(WorkerState::TerminationRequested);
                info!("Stop requested during a pass, cancelling pending operations");
                self.reconciler.cancel_pending().await;
                self.report_pass(pass.await);
                debug!("Maintenance worker exited");
                return;
            }
            drop(pass);

            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        self.stats.set_state(WorkerState::TerminationRequested);
        info!("Maintenance worker stopping");
        self.reconciler.cancel_pending().await;
        debug!("Maintenance worker exited");
    }

    fn report_pass(&self, result: Result<PassReport, ReconcileError>) {
        self.stats.record(&result);
        match result {
            Ok(report) => debug!(
                created = report.created,
                dropped = report.dropped,
                status = ?report.status,
                "Reconciliation pass complete"
            ),
            Err(e) => warn!(
                error = %e,
                failures = self.stats.failures(),
                "Reconciliation pass failed, will retry"
            ),
        }
    }
}

/// Resolves once a stop is requested. A closed channel counts as a request.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use infravisor_reconcile::{ConvergenceStatus, ProcessorError, StoreError};
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Script {
        calls: AtomicU64,
        fail: AtomicBool,
        cancelled: AtomicBool,
    }

    struct ScriptedReconciler(Arc<Script>);

    #[async_trait]
    impl Reconciler for ScriptedReconciler {
        async fn reconcile(&self, _infra_id: InfraId) -> Result<PassReport, ReconcileError> {
            self.0.calls.fetch_add(1, Ordering::SeqCst);
            if self.0.fail.load(Ordering::SeqCst) {
                Err(StoreError::Backend("unavailable".into()).into())
            } else {
                Ok(PassReport {
                    status: ConvergenceStatus::Converged,
                    ..Default::default()
                })
            }
        }

        async fn cancel_pending(&self) {
            self.0.cancelled.store(true, Ordering::SeqCst);
        }
    }

    fn spawn_worker(
        script: &Arc<Script>,
    ) -> (
        Arc<WorkerStats>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<()>,
    ) {
        let stats = Arc::new(WorkerStats::default());
        let worker = MaintenanceWorker::new(
            InfraId::new(),
            Duration::from_secs(10),
            ProcessStrategy::Sequential,
            Box::new(ScriptedReconciler(Arc::clone(script))),
            Arc::clone(&stats),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));
        (stats, tx, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_passes_run_at_interval() {
        let script = Arc::new(Script::default());
        let (stats, tx, handle) = spawn_worker(&script);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(script.calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.passes(), 3);
        assert_eq!(stats.state(), WorkerState::Running);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(script.cancelled.load(Ordering::SeqCst));
        assert_eq!(stats.state(), WorkerState::TerminationRequested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_retried() {
        let script = Arc::new(Script::default());
        script.fail.store(true, Ordering::SeqCst);
        let (stats, tx, handle) = spawn_worker(&script);

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(stats.failures(), 4);
        assert_eq!(stats.last_error().as_deref(), Some("store backend error: unavailable"));
        assert!(!handle.is_finished());

        script.fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(stats.passes(), 1);
        assert_eq!(stats.last_error(), None);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    /// Holds its pass open until cancelled, then fails it the way a
    /// processor reports a cancelled operation.
    #[derive(Default)]
    struct SlowPass {
        cancel: tokio::sync::Notify,
        finished: AtomicBool,
    }

    struct SlowReconciler(Arc<SlowPass>);

    #[async_trait]
    impl Reconciler for SlowReconciler {
        async fn reconcile(&self, _infra_id: InfraId) -> Result<PassReport, ReconcileError> {
            let cancelled = tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(30)) => false,
                _ = self.0.cancel.notified() => true,
            };
            self.0.finished.store(true, Ordering::SeqCst);
            if cancelled {
                Err(ProcessorError::Cancelled.into())
            } else {
                Ok(PassReport::default())
            }
        }

        async fn cancel_pending(&self) {
            self.0.cancel.notify_waiters();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_pass_cancels_and_waits_for_the_pass() {
        let slow = Arc::new(SlowPass::default());
        let stats = Arc::new(WorkerStats::default());
        let worker = MaintenanceWorker::new(
            InfraId::new(),
            Duration::from_secs(10),
            ProcessStrategy::Sequential,
            Box::new(SlowReconciler(Arc::clone(&slow))),
            Arc::clone(&stats),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let stopped_at = tokio::time::Instant::now();
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(slow.finished.load(Ordering::SeqCst));
        assert!(stopped_at.elapsed() < Duration::from_secs(1));
        assert_eq!(stats.failures(), 1);
        assert_eq!(stats.last_error().as_deref(), Some("operation cancelled"));
        assert_eq!(stats.state(), WorkerState::TerminationRequested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sender_stops_worker() {
        let script = Arc::new(Script::default());
        let (_, tx, handle) = spawn_worker(&script);

        drop(tx);
        handle.await.unwrap();
        assert!(script.cancelled.load(Ordering::SeqCst));
    }
}

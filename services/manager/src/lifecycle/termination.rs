//! Graceful termination of maintenance workers.
//!
//! A worker is stopped in two phases:
//! 1. Signal the unit cooperatively and wait up to `wait_timeout` for it to exit
//! 2. If it is still running, kill it and wait until it is gone
//!
//! Either way the unit is reaped before the report is returned, so a
//! terminated worker can never keep mutating resources.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use infravisor_id::InfraId;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// =============================================================================
// Execution Units
// =============================================================================

/// How an execution unit ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "message")]
pub enum UnitExit {
    /// The unit returned on its own.
    Completed,

    /// The unit was killed.
    Killed,

    /// The unit panicked. The panic never reaches the supervisor.
    Panicked(String),
}

/// An isolated, independently scheduled unit of execution.
#[async_trait]
pub trait ExecutionUnit: Send {
    /// Ask the unit to stop. Returns immediately.
    fn interrupt(&self);

    /// Returns true until the unit has exited.
    fn is_running(&self) -> bool;

    /// Wait until the unit exits.
    ///
    /// Must be cancel safe: dropping the future before it completes leaves
    /// the unit waitable again.
    async fn wait(&mut self) -> UnitExit;

    /// Stop the unit without its cooperation, then wait until it is gone.
    async fn kill(&mut self) -> UnitExit;
}

/// An execution unit backed by a tokio task.
///
/// The task receives a stop signal through a `watch` channel. Dropping the
/// unit drops the sender, which the task also observes as a stop request.
pub struct TaskUnit {
    handle: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
    exit: Option<UnitExit>,
}

impl TaskUnit {
    /// Spawn `f` as a new task, handing it the stop receiver.
    pub fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(f(stop_rx));
        Self {
            handle,
            stop_tx,
            exit: None,
        }
    }

    async fn reap(&mut self) -> UnitExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }

        let exit = match (&mut self.handle).await {
            Ok(()) => UnitExit::Completed,
            Err(e) if e.is_cancelled() => UnitExit::Killed,
            Err(e) => UnitExit::Panicked(panic_message(e)),
        };
        self.exit = Some(exit.clone());
        exit
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(e) => e.to_string(),
    }
}

#[async_trait]
impl ExecutionUnit for TaskUnit {
    fn interrupt(&self) {
        let _ = self.stop_tx.send(true);
    }

    fn is_running(&self) -> bool {
        self.exit.is_none() && !self.handle.is_finished()
    }

    async fn wait(&mut self) -> UnitExit {
        self.reap().await
    }

    async fn kill(&mut self) -> UnitExit {
        if self.exit.is_none() {
            self.handle.abort();
        }
        self.reap().await
    }
}

// =============================================================================
// Termination Protocol
// =============================================================================

/// Phases of the termination protocol, in the order they are traversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationPhase {
    Requested,
    SignalSent,
    Exited,
    Escalated,
    Reaped,
}

/// How a termination ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationOutcome {
    /// The unit exited within the wait timeout.
    Graceful,

    /// The unit had to be killed.
    Escalated,
}

/// What happened while terminating one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminationReport {
    pub infra_id: InfraId,
    pub phases: Vec<TerminationPhase>,
    pub outcome: TerminationOutcome,
    pub exit: UnitExit,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl TerminationReport {
    pub fn escalated(&self) -> bool {
        self.outcome == TerminationOutcome::Escalated
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Run the termination protocol against `unit`.
///
/// Escalation happens at most once, and only after the full `wait_timeout`
/// has elapsed since the signal was sent.
pub async fn graceful_terminate<U>(
    infra_id: InfraId,
    unit: &mut U,
    wait_timeout: Duration,
) -> TerminationReport
where
    U: ExecutionUnit + ?Sized,
{
    let started = Instant::now();
    let mut phases = vec![TerminationPhase::Requested];

    unit.interrupt();
    phases.push(TerminationPhase::SignalSent);
    debug!(infra_id = %infra_id, timeout_ms = wait_timeout.as_millis() as u64, "Stop signal sent");

    let (outcome, exit) = match tokio::time::timeout(wait_timeout, unit.wait()).await {
        Ok(exit) => {
            phases.push(TerminationPhase::Exited);
            (TerminationOutcome::Graceful, exit)
        }
        Err(_) => {
            warn!(
                infra_id = %infra_id,
                timeout_ms = wait_timeout.as_millis() as u64,
                "Maintenance worker did not stop in time, killing it"
            );
            phases.push(TerminationPhase::Escalated);
            (TerminationOutcome::Escalated, unit.kill().await)
        }
    };
    phases.push(TerminationPhase::Reaped);

    if let UnitExit::Panicked(message) = &exit {
        warn!(infra_id = %infra_id, panic = %message, "Maintenance worker had panicked");
    }

    let report = TerminationReport {
        infra_id,
        phases,
        outcome,
        exit,
        elapsed: started.elapsed(),
    };

    info!(
        infra_id = %infra_id,
        outcome = ?report.outcome,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Maintenance worker terminated"
    );
    report
}

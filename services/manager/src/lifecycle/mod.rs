//! Supervision of maintenance workers.
//!
//! - [`LifecycleManager`]: the process table and the lifecycle operations
//! - [`MaintenanceWorker`]: the per-infrastructure reconciliation loop
//! - [`graceful_terminate`]: signal, wait, then kill

mod error;
mod locks;
mod manager;
mod termination;
mod worker;

pub use error::{LifecycleOp, ManagerError};
pub use locks::{KeyedGuard, KeyedLocks};
pub use manager::{LifecycleManager, ManagedInfo, ManagerContext, WorkerSettings};
pub use termination::{
    graceful_terminate, ExecutionUnit, TaskUnit, TerminationOutcome, TerminationPhase,
    TerminationReport, UnitExit,
};
pub use worker::{MaintenanceWorker, WorkerState, WorkerStats};

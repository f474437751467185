//! Lifecycle manager errors.

use std::fmt;

use infravisor_id::InfraId;
use infravisor_reconcile::{CompileError, ProcessorError, StoreError};
use thiserror::Error;

/// The lifecycle operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOp {
    Submit,
    StartProvisioning,
    StopProvisioning,
    Get,
    TearDown,
    Describe,
}

impl fmt::Display for LifecycleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Submit => "submit",
            Self::StartProvisioning => "start_provisioning",
            Self::StopProvisioning => "stop_provisioning",
            Self::Get => "get",
            Self::TearDown => "tear_down",
            Self::Describe => "describe",
        };
        f.write_str(name)
    }
}

/// Errors returned by the lifecycle manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// A maintenance worker already runs for this infrastructure.
    #[error("infrastructure {infra_id} is already managed")]
    AlreadyManaged { infra_id: InfraId },

    #[error("{operation}: infrastructure {infra_id} not found")]
    NotFound {
        infra_id: InfraId,
        operation: LifecycleOp,
    },

    /// Teardown was requested while a worker still runs; detach first.
    #[error("infrastructure {infra_id} is still managed; detach it before tearing it down")]
    StillManaged { infra_id: InfraId },

    #[error("invalid infrastructure description: {0}")]
    Compilation(#[from] CompileError),

    #[error("{operation}: store failure for infrastructure {infra_id}: {source}")]
    Store {
        infra_id: InfraId,
        operation: LifecycleOp,
        #[source]
        source: StoreError,
    },

    /// The manager is shutting down and starts no new workers.
    #[error("cannot start maintenance of infrastructure {infra_id}: manager is shutting down")]
    ShuttingDown { infra_id: InfraId },

    #[error("failed to tear down infrastructure {infra_id}: {source}")]
    Teardown {
        infra_id: InfraId,
        #[source]
        source: ProcessorError,
    },
}

impl ManagerError {
    pub(crate) fn not_found(infra_id: InfraId, operation: LifecycleOp) -> Self {
        Self::NotFound {
            infra_id,
            operation,
        }
    }

    pub(crate) fn store(infra_id: InfraId, operation: LifecycleOp) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Store {
            infra_id,
            operation,
            source,
        }
    }

    /// Returns true for errors caused by an unknown infrastructure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

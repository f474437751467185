//! Reconciliation contracts and collaborators.
//!
//! The lifecycle manager supervises one maintenance loop per infrastructure
//! but knows nothing about how an infrastructure is described, stored or
//! provisioned. Everything it needs from the outside world is expressed as a
//! trait in this crate:
//!
//! - [`Compiler`]: turns a raw definition into a validated [`StaticDescription`]
//! - [`InfraStore`]: persists descriptions and the dynamic (observed) state
//! - [`Reconciler`] / [`ReconcilerFactory`]: one reconciliation pass
//! - [`ResourceProcessor`] / [`ProcessorFactory`]: creates and drops node instances
//! - [`InfoBroker`]: answers keyed information queries
//!
//! Each contract ships with a small in-memory implementation so the whole
//! system runs without external services. They are intentionally simple.
//!
//! # Invariants
//!
//! - A reconciliation pass is idempotent: repeating it with no new input
//!   issues no further instructions
//! - Scaling targets always stay within the node's `[min, max]` bounds
//! - Reconciliation errors are transient; callers retry them

mod compiler;
mod convergence;
mod description;
mod enactor;
mod info;
mod processor;
mod scaling;
mod store;

pub use compiler::{CompileError, Compiler, DescriptionCompiler};
pub use convergence::{select_for_drain, ConvergenceStatus, DrainPriority, SpecHash};
pub use description::{
    InfraDefinition, NodeDefinition, NodeDescription, ScalingBounds, StaticDescription,
};
pub use enactor::{
    plan_node, Enactor, EnactorFactory, Instruction, NodePlan, PassReport, ProcessStrategy,
    ReconcileError, Reconciler, ReconcilerFactory,
};
pub use info::{
    EchoInfoProvider, InfoBroker, InfoError, InfoParams, InfoProvider, InfoRouter,
    StoreInfoProvider,
};
pub use processor::{
    ProcessorError, ProcessorFactory, ProcessorStats, ResourceProcessor, SimulatedProcessor,
    SimulatedProcessorFactory,
};
pub use scaling::{ScalingQueue, ScalingReport, ScalingRequest};
pub use store::{
    DynamicState, InfraStore, InstanceState, MemoryStore, NodeInstance, NodeState, StoreError,
};

use std::time::Duration;

/// Default interval between reconciliation passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

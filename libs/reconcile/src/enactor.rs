//! Instance-count reconciler.
//!
//! Each pass compares the persisted description (plus any queued scaling
//! requests) with the dynamic state and issues create/drop instructions to a
//! resource processor until every node runs its target number of healthy
//! instances.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use infravisor_id::{InfraId, NodeInstanceId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::convergence::{select_for_drain, ConvergenceStatus, DrainPriority};
use crate::description::{NodeDescription, StaticDescription};
use crate::processor::{ProcessorError, ProcessorFactory, ResourceProcessor};
use crate::scaling::{ScalingQueue, ScalingRequest};
use crate::store::{InfraStore, InstanceState, NodeInstance, NodeState, StoreError};

/// How the instructions of one pass are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStrategy {
    /// One instruction after another, in dependency order.
    #[default]
    Sequential,

    /// All instructions of a pass at once.
    Parallel,
}

impl fmt::Display for ProcessStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

impl FromStr for ProcessStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            other => Err(format!(
                "unknown process strategy '{other}' (expected 'sequential' or 'parallel')"
            )),
        }
    }
}

/// Errors from a reconciliation pass. All of them are transient.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("no description stored for infrastructure {0}")]
    DescriptionMissing(InfraId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    pub created: usize,
    pub dropped: usize,
    pub status: ConvergenceStatus,
}

/// One reconciliation pass for one infrastructure.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Run a single pass. Errors are transient; the caller retries.
    async fn reconcile(&self, infra_id: InfraId) -> Result<PassReport, ReconcileError>;

    /// Best-effort cancellation of sub-operations still in flight.
    async fn cancel_pending(&self);
}

/// Creates the reconciler a maintenance worker drives.
pub trait ReconcilerFactory: Send + Sync {
    fn create(&self, infra_id: InfraId, strategy: ProcessStrategy) -> Box<dyn Reconciler>;
}

/// A corrective action for the resource processor.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    CreateNode { node: String },
    DropNode { instance: NodeInstance },
}

/// What a pass will do to one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodePlan {
    /// Desired instance count after applying the scaling requests.
    pub target: u32,
    pub instructions: Vec<Instruction>,
}

/// Plan one node.
///
/// The target starts from the stored target (or the node minimum), moves by
/// the queued requests and is clamped into the node's bounds. Failed
/// instances and explicitly requested drops are always removed; the rest is
/// topped up or trimmed to the target, trimming not-ready instances before
/// the oldest ready ones.
pub fn plan_node(
    node: &NodeDescription,
    state: Option<&NodeState>,
    requests: &[ScalingRequest],
) -> NodePlan {
    let mut target = i64::from(state.and_then(|s| s.target).unwrap_or(node.scaling.min));
    let mut explicit: HashSet<NodeInstanceId> = HashSet::new();

    for request in requests.iter().filter(|r| r.node_name() == node.name) {
        match request {
            ScalingRequest::Create { count, .. } => target += i64::from(*count),
            ScalingRequest::Drop { node_id, .. } => {
                target -= 1;
                if let Some(id) = node_id {
                    explicit.insert(*id);
                }
            }
        }
    }

    let target = node
        .scaling
        .clamp(u32::try_from(target.max(0)).unwrap_or(u32::MAX));

    let mut instructions = Vec::new();
    let mut healthy = Vec::new();
    for instance in state.into_iter().flat_map(|s| s.instances.values()) {
        if instance.state == InstanceState::Failed || explicit.contains(&instance.node_id) {
            instructions.push(Instruction::DropNode {
                instance: instance.clone(),
            });
        } else {
            healthy.push(instance.clone());
        }
    }

    let wanted = target as usize;
    if healthy.len() < wanted {
        for _ in healthy.len()..wanted {
            instructions.push(Instruction::CreateNode {
                node: node.name.clone(),
            });
        }
    } else if healthy.len() > wanted {
        let excess = healthy.len() - wanted;
        let ordered = select_for_drain(healthy, |i| match i.state {
            InstanceState::Failed => DrainPriority::Failed,
            InstanceState::Pending => DrainPriority::NotReady,
            InstanceState::Ready => DrainPriority::Oldest,
        });
        instructions.extend(
            ordered
                .into_iter()
                .take(excess)
                .map(|instance| Instruction::DropNode { instance }),
        );
    }

    NodePlan {
        target,
        instructions,
    }
}

/// Result of executing one instruction.
enum Applied {
    Created(NodeInstance),
    Dropped(NodeInstance),
}

/// Reconciler driving a resource processor toward the stored targets.
pub struct Enactor {
    store: Arc<dyn InfraStore>,
    processor: Arc<dyn ResourceProcessor>,
    scaling: Arc<ScalingQueue>,
    strategy: ProcessStrategy,
}

impl Enactor {
    pub fn new(
        store: Arc<dyn InfraStore>,
        processor: Arc<dyn ResourceProcessor>,
        scaling: Arc<ScalingQueue>,
        strategy: ProcessStrategy,
    ) -> Self {
        Self {
            store,
            processor,
            scaling,
            strategy,
        }
    }

    async fn execute(
        &self,
        description: &StaticDescription,
        instruction: Instruction,
    ) -> Result<Applied, ProcessorError> {
        match instruction {
            Instruction::CreateNode { node } => {
                let node = description
                    .node(&node)
                    .ok_or_else(|| ProcessorError::Create {
                        node: node.clone(),
                        message: "node is not part of the description".to_string(),
                    })?;
                let instance = self.processor.create_node(description, node).await?;
                Ok(Applied::Created(instance))
            }
            Instruction::DropNode { instance } => {
                self.processor.drop_node(&instance).await?;
                Ok(Applied::Dropped(instance))
            }
        }
    }

    async fn apply(&self, applied: Applied, report: &mut PassReport) -> Result<(), StoreError> {
        match applied {
            Applied::Created(instance) => {
                self.store.upsert_instance(instance).await?;
                report.created += 1;
            }
            Applied::Dropped(instance) => {
                self.store
                    .remove_instance(instance.infra_id, &instance.node_name, instance.node_id)
                    .await?;
                report.dropped += 1;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for Enactor {
    async fn reconcile(&self, infra_id: InfraId) -> Result<PassReport, ReconcileError> {
        let description = self
            .store
            .get_infrastructure(infra_id)
            .await?
            .ok_or(ReconcileError::DescriptionMissing(infra_id))?;
        let state = self.store.dynamic_state(infra_id).await?;
        let requests = self.scaling.drain(infra_id).await;

        let mut instructions = Vec::new();
        for node in &description.nodes {
            let current = state.node(&node.name);
            let plan = plan_node(node, current, &requests);
            if current.and_then(|s| s.target) != Some(plan.target) {
                self.store.set_target(infra_id, &node.name, plan.target).await?;
            }
            instructions.extend(plan.instructions);
        }

        let mut report = PassReport {
            status: if instructions.is_empty() {
                ConvergenceStatus::Converged
            } else {
                ConvergenceStatus::Converging
            },
            ..Default::default()
        };

        if instructions.is_empty() {
            debug!(infra_id = %infra_id, "Infrastructure converged");
            return Ok(report);
        }

        match self.strategy {
            ProcessStrategy::Sequential => {
                for instruction in instructions {
                    let applied = self.execute(&description, instruction).await?;
                    self.apply(applied, &mut report).await?;
                }
            }
            ProcessStrategy::Parallel => {
                let results = join_all(
                    instructions
                        .into_iter()
                        .map(|instruction| self.execute(&description, instruction)),
                )
                .await;

                let mut first_error = None;
                for result in results {
                    match result {
                        Ok(applied) => self.apply(applied, &mut report).await?,
                        Err(e) => {
                            first_error.get_or_insert(e);
                        }
                    }
                }
                if let Some(e) = first_error {
                    return Err(e.into());
                }
            }
        }

        info!(
            infra_id = %infra_id,
            created = report.created,
            dropped = report.dropped,
            strategy = %self.strategy,
            "Reconciliation pass applied changes"
        );
        Ok(report)
    }

    async fn cancel_pending(&self) {
        self.processor.cancel_pending().await;
    }
}

/// Builds an [`Enactor`] with a fresh processor for every worker.
pub struct EnactorFactory {
    store: Arc<dyn InfraStore>,
    processors: Arc<dyn ProcessorFactory>,
    scaling: Arc<ScalingQueue>,
}

impl EnactorFactory {
    pub fn new(
        store: Arc<dyn InfraStore>,
        processors: Arc<dyn ProcessorFactory>,
        scaling: Arc<ScalingQueue>,
    ) -> Self {
        Self {
            store,
            processors,
            scaling,
        }
    }
}

impl ReconcilerFactory for EnactorFactory {
    fn create(&self, infra_id: InfraId, strategy: ProcessStrategy) -> Box<dyn Reconciler> {
        debug!(infra_id = %infra_id, strategy = %strategy, "Creating enactor");
        Box::new(Enactor::new(
            Arc::clone(&self.store),
            self.processors.instantiate(),
            Arc::clone(&self.scaling),
            strategy,
        ))
    }
}

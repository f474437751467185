//! Resource processor interface and simulated implementation.
//!
//! The resource processor is the only component that touches provisioned
//! resources:
//! - Creating node instances
//! - Dropping node instances and whole infrastructures
//!
//! A simulated implementation is provided for testing and development.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use infravisor_id::{InfraId, NodeInstanceId};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::description::{NodeDescription, StaticDescription};
use crate::store::{InstanceState, NodeInstance};

/// Resource processor errors.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("failed to create instance of node '{node}': {message}")]
    Create { node: String, message: String },

    #[error("failed to drop instance {node_id}: {message}")]
    Drop {
        node_id: NodeInstanceId,
        message: String,
    },

    #[error("failed to drop infrastructure {infra_id}: {message}")]
    DropInfrastructure { infra_id: InfraId, message: String },

    /// The operation was cancelled through `cancel_pending`.
    #[error("operation cancelled")]
    Cancelled,
}

/// Provisioning backend.
#[async_trait]
pub trait ResourceProcessor: Send + Sync {
    /// Provision one new instance of `node`.
    async fn create_node(
        &self,
        description: &StaticDescription,
        node: &NodeDescription,
    ) -> Result<NodeInstance, ProcessorError>;

    /// Destroy one instance.
    async fn drop_node(&self, instance: &NodeInstance) -> Result<(), ProcessorError>;

    /// Release infrastructure-level resources once all instances are gone.
    async fn drop_infrastructure(&self, infra_id: InfraId) -> Result<(), ProcessorError>;

    /// Best-effort cancellation of in-flight operations.
    async fn cancel_pending(&self);
}

/// Creates resource processors.
///
/// Every maintenance worker and every teardown gets its own processor.
pub trait ProcessorFactory: Send + Sync {
    fn instantiate(&self) -> Arc<dyn ResourceProcessor>;
}

/// Counters shared by all processors of one factory.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    pub instantiated: AtomicU64,
    pub created: AtomicU64,
    pub dropped: AtomicU64,
    pub infrastructures_dropped: AtomicU64,
    pub cancellations: AtomicU64,
}

impl ProcessorStats {
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn infrastructures_dropped(&self) -> u64 {
        self.infrastructures_dropped.load(Ordering::SeqCst)
    }

    pub fn instantiated(&self) -> u64 {
        self.instantiated.load(Ordering::SeqCst)
    }
}

/// Simulated processor: instances come up `Ready` after a fixed latency.
pub struct SimulatedProcessor {
    latency: Duration,
    fail_creates: bool,
    stats: Arc<ProcessorStats>,
    cancel: Notify,
    cancelled: AtomicBool,
}

impl SimulatedProcessor {
    pub fn new(latency: Duration, stats: Arc<ProcessorStats>) -> Self {
        Self {
            latency,
            fail_creates: false,
            stats,
            cancel: Notify::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    /// A processor whose creates always fail.
    pub fn failing(stats: Arc<ProcessorStats>) -> Self {
        Self {
            fail_creates: true,
            ..Self::new(Duration::ZERO, stats)
        }
    }

    /// Wait out the simulated latency unless cancelled first.
    ///
    /// Cancellation is sticky: once `cancel_pending` ran, every later
    /// operation fails immediately.
    async fn simulate_latency(&self) -> Result<(), ProcessorError> {
        let notified = self.cancel.notified();
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(ProcessorError::Cancelled);
        }
        if self.latency.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(self.latency) => Ok(()),
            _ = notified => Err(ProcessorError::Cancelled),
        }
    }

    fn next_address(&self) -> String {
        let n = self.stats.created.fetch_add(1, Ordering::SeqCst);
        format!("10.{}.{}.{}", (n >> 16) & 0xff, (n >> 8) & 0xff, n & 0xff)
    }
}

#[async_trait]
impl ResourceProcessor for SimulatedProcessor {
    async fn create_node(
        &self,
        description: &StaticDescription,
        node: &NodeDescription,
    ) -> Result<NodeInstance, ProcessorError> {
        if self.fail_creates {
            return Err(ProcessorError::Create {
                node: node.name.clone(),
                message: "simulated processor configured to fail".to_string(),
            });
        }

        self.simulate_latency().await?;

        let instance = NodeInstance {
            node_id: NodeInstanceId::new(),
            infra_id: description.infra_id,
            node_name: node.name.clone(),
            resource_address: Some(self.next_address()),
            state: InstanceState::Ready,
            created_at: Utc::now(),
        };

        info!(
            infra_id = %description.infra_id,
            node = %node.name,
            node_id = %instance.node_id,
            "[SIM] Created node instance"
        );

        Ok(instance)
    }

    async fn drop_node(&self, instance: &NodeInstance) -> Result<(), ProcessorError> {
        self.simulate_latency().await?;
        self.stats.dropped.fetch_add(1, Ordering::SeqCst);

        info!(
            infra_id = %instance.infra_id,
            node = %instance.node_name,
            node_id = %instance.node_id,
            "[SIM] Dropped node instance"
        );
        Ok(())
    }

    async fn drop_infrastructure(&self, infra_id: InfraId) -> Result<(), ProcessorError> {
        self.simulate_latency().await?;
        self.stats
            .infrastructures_dropped
            .fetch_add(1, Ordering::SeqCst);

        info!(infra_id = %infra_id, "[SIM] Dropped infrastructure");
        Ok(())
    }

    async fn cancel_pending(&self) {
        self.stats.cancellations.fetch_add(1, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel.notify_waiters();
        debug!("[SIM] Cancelled pending operations");
    }
}

/// Factory for [`SimulatedProcessor`]s sharing one set of counters.
#[derive(Clone)]
pub struct SimulatedProcessorFactory {
    latency: Duration,
    fail_creates: bool,
    stats: Arc<ProcessorStats>,
}

impl SimulatedProcessorFactory {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            fail_creates: false,
            stats: Arc::new(ProcessorStats::default()),
        }
    }

    /// A factory whose processors fail every create.
    pub fn failing() -> Self {
        Self {
            fail_creates: true,
            ..Self::new(Duration::ZERO)
        }
    }

    pub fn stats(&self) -> Arc<ProcessorStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for SimulatedProcessorFactory {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl ProcessorFactory for SimulatedProcessorFactory {
    fn instantiate(&self) -> Arc<dyn ResourceProcessor> {
        self.stats.instantiated.fetch_add(1, Ordering::SeqCst);
        let stats = Arc::clone(&self.stats);
        if self.fail_creates {
            Arc::new(SimulatedProcessor::failing(stats))
        } else {
            Arc::new(SimulatedProcessor::new(self.latency, stats))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{Compiler, DescriptionCompiler};

    fn description() -> StaticDescription {
        DescriptionCompiler
            .compile("name: t\nnodes: [{name: web}]")
            .unwrap()
    }

    #[tokio::test]
    async fn test_simulated_create_and_drop() {
        let factory = SimulatedProcessorFactory::default();
        let processor = factory.instantiate();
        let desc = description();

        let instance = processor.create_node(&desc, &desc.nodes[0]).await.unwrap();
        assert_eq!(instance.infra_id, desc.infra_id);
        assert_eq!(instance.node_name, "web");
        assert_eq!(instance.state, InstanceState::Ready);
        assert_eq!(instance.resource_address.as_deref(), Some("10.0.0.0"));

        processor.drop_node(&instance).await.unwrap();
        processor.drop_infrastructure(desc.infra_id).await.unwrap();

        let stats = factory.stats();
        assert_eq!(stats.instantiated(), 1);
        assert_eq!(stats.created(), 1);
        assert_eq!(stats.dropped(), 1);
        assert_eq!(stats.infrastructures_dropped(), 1);
    }

    #[tokio::test]
    async fn test_failing_processor() {
        let processor = SimulatedProcessorFactory::failing().instantiate();
        let desc = description();

        let err = processor.create_node(&desc, &desc.nodes[0]).await.unwrap_err();
        assert!(matches!(err, ProcessorError::Create { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_in_flight_create() {
        let processor = Arc::new(SimulatedProcessor::new(
            Duration::from_secs(30),
            Arc::new(ProcessorStats::default()),
        ));
        let desc = description();

        let create = tokio::spawn({
            let processor = Arc::clone(&processor);
            let desc = desc.clone();
            async move { processor.create_node(&desc, &desc.nodes[0]).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        processor.cancel_pending().await;

        let result = create.await.unwrap();
        assert!(matches!(result, Err(ProcessorError::Cancelled)));

        // Nothing new starts after a cancellation.
        let err = processor.create_node(&desc, &desc.nodes[0]).await.unwrap_err();
        assert!(matches!(err, ProcessorError::Cancelled));
        assert_eq!(processor.stats.created(), 0);
    }
}

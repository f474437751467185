//! Infrastructure store: persisted descriptions plus observed state.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use infravisor_id::{InfraId, NodeInstanceId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::description::StaticDescription;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An infrastructure with this ID is already stored.
    #[error("infrastructure already stored: {0}")]
    AlreadyExists(InfraId),

    /// No infrastructure with this ID is stored.
    #[error("infrastructure not stored: {0}")]
    NotFound(InfraId),

    /// The storage backend failed.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Lifecycle state of a node instance, as reported by the resource processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Ready,
    Failed,
}

/// One provisioned instance of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    pub node_id: NodeInstanceId,
    pub infra_id: InfraId,
    pub node_name: String,
    pub resource_address: Option<String>,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
}

/// Observed state of a single node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    /// Desired instance count, once a pass has settled on one.
    pub target: Option<u32>,

    /// Instances keyed by ID (and therefore ordered oldest-first).
    pub instances: BTreeMap<NodeInstanceId, NodeInstance>,
}

/// Observed state of a whole infrastructure, keyed by node name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DynamicState {
    pub nodes: BTreeMap<String, NodeState>,
}

impl DynamicState {
    pub fn node(&self, name: &str) -> Option<&NodeState> {
        self.nodes.get(name)
    }

    /// All instances of all nodes.
    pub fn instances(&self) -> impl Iterator<Item = &NodeInstance> {
        self.nodes.values().flat_map(|n| n.instances.values())
    }

    pub fn instance_count(&self) -> usize {
        self.nodes.values().map(|n| n.instances.len()).sum()
    }
}

/// Persistence for infrastructure descriptions and dynamic state.
#[async_trait]
pub trait InfraStore: Send + Sync {
    /// Persist a freshly compiled description.
    async fn add_infrastructure(&self, description: StaticDescription) -> Result<(), StoreError>;

    /// Fetch a description, `None` if it was never stored or was removed.
    async fn get_infrastructure(
        &self,
        infra_id: InfraId,
    ) -> Result<Option<StaticDescription>, StoreError>;

    /// Remove a description together with its dynamic state.
    async fn remove_infrastructure(&self, infra_id: InfraId) -> Result<(), StoreError>;

    async fn list_infrastructures(&self) -> Result<Vec<InfraId>, StoreError>;

    async fn dynamic_state(&self, infra_id: InfraId) -> Result<DynamicState, StoreError>;

    /// Insert or replace an instance record.
    async fn upsert_instance(&self, instance: NodeInstance) -> Result<(), StoreError>;

    async fn remove_instance(
        &self,
        infra_id: InfraId,
        node_name: &str,
        node_id: NodeInstanceId,
    ) -> Result<(), StoreError>;

    async fn set_target(
        &self,
        infra_id: InfraId,
        node_name: &str,
        target: u32,
    ) -> Result<(), StoreError>;
}

struct StoredInfra {
    description: StaticDescription,
    state: DynamicState,
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    infrastructures: RwLock<HashMap<InfraId, StoredInfra>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InfraStore for MemoryStore {
    async fn add_infrastructure(&self, description: StaticDescription) -> Result<(), StoreError> {
        let infra_id = description.infra_id;
        let mut infrastructures = self.infrastructures.write().await;
        if infrastructures.contains_key(&infra_id) {
            return Err(StoreError::AlreadyExists(infra_id));
        }

        let state = DynamicState {
            nodes: description
                .nodes
                .iter()
                .map(|n| (n.name.clone(), NodeState::default()))
                .collect(),
        };
        infrastructures.insert(infra_id, StoredInfra { description, state });
        debug!(infra_id = %infra_id, "Stored infrastructure description");
        Ok(())
    }

    async fn get_infrastructure(
        &self,
        infra_id: InfraId,
    ) -> Result<Option<StaticDescription>, StoreError> {
        let infrastructures = self.infrastructures.read().await;
        Ok(infrastructures.get(&infra_id).map(|s| s.description.clone()))
    }

    async fn remove_infrastructure(&self, infra_id: InfraId) -> Result<(), StoreError> {
        let mut infrastructures = self.infrastructures.write().await;
        if infrastructures.remove(&infra_id).is_none() {
            return Err(StoreError::NotFound(infra_id));
        }
        debug!(infra_id = %infra_id, "Removed infrastructure description");
        Ok(())
    }

    async fn list_infrastructures(&self) -> Result<Vec<InfraId>, StoreError> {
        let infrastructures = self.infrastructures.read().await;
        let mut ids: Vec<_> = infrastructures.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn dynamic_state(&self, infra_id: InfraId) -> Result<DynamicState, StoreError> {
        let infrastructures = self.infrastructures.read().await;
        infrastructures
            .get(&infra_id)
            .map(|s| s.state.clone())
            .ok_or(StoreError::NotFound(infra_id))
    }

    async fn upsert_instance(&self, instance: NodeInstance) -> Result<(), StoreError> {
        let mut infrastructures = self.infrastructures.write().await;
        let stored = infrastructures
            .get_mut(&instance.infra_id)
            .ok_or(StoreError::NotFound(instance.infra_id))?;

        stored
            .state
            .nodes
            .entry(instance.node_name.clone())
            .or_default()
            .instances
            .insert(instance.node_id, instance);
        Ok(())
    }

    async fn remove_instance(
        &self,
        infra_id: InfraId,
        node_name: &str,
        node_id: NodeInstanceId,
    ) -> Result<(), StoreError> {
        let mut infrastructures = self.infrastructures.write().await;
        let stored = infrastructures
            .get_mut(&infra_id)
            .ok_or(StoreError::NotFound(infra_id))?;

        if let Some(node) = stored.state.nodes.get_mut(node_name) {
            node.instances.remove(&node_id);
        }
        Ok(())
    }

    async fn set_target(
        &self,
        infra_id: InfraId,
        node_name: &str,
        target: u32,
    ) -> Result<(), StoreError> {
        let mut infrastructures = self.infrastructures.write().await;
        let stored = infrastructures
            .get_mut(&infra_id)
            .ok_or(StoreError::NotFound(infra_id))?;

        stored
            .state
            .nodes
            .entry(node_name.to_string())
            .or_default()
            .target = Some(target);
        Ok(())
    }
}

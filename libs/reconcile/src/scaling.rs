//! Pending scaling requests.
//!
//! Requests are queued by the control API and consumed by the next
//! reconciliation pass of the owning infrastructure.

use std::collections::HashMap;

use infravisor_id::{InfraId, NodeInstanceId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::description::NodeDescription;
use crate::store::NodeState;

/// A manual scaling request against one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScalingRequest {
    /// Add `count` instances.
    Create { node_name: String, count: u32 },

    /// Remove one instance, a specific one if `node_id` is given.
    Drop {
        node_name: String,
        node_id: Option<NodeInstanceId>,
    },
}

impl ScalingRequest {
    pub fn node_name(&self) -> &str {
        match self {
            Self::Create { node_name, .. } | Self::Drop { node_name, .. } => node_name,
        }
    }
}

/// Per-infrastructure queue of scaling requests.
#[derive(Debug, Default)]
pub struct ScalingQueue {
    pending: Mutex<HashMap<InfraId, Vec<ScalingRequest>>>,
}

impl ScalingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_create_request(&self, infra_id: InfraId, node_name: &str, count: u32) {
        self.push(
            infra_id,
            ScalingRequest::Create {
                node_name: node_name.to_string(),
                count,
            },
        )
        .await;
    }

    pub async fn add_drop_request(
        &self,
        infra_id: InfraId,
        node_name: &str,
        node_id: Option<NodeInstanceId>,
    ) {
        self.push(
            infra_id,
            ScalingRequest::Drop {
                node_name: node_name.to_string(),
                node_id,
            },
        )
        .await;
    }

    async fn push(&self, infra_id: InfraId, request: ScalingRequest) {
        debug!(infra_id = %infra_id, node = %request.node_name(), "Queued scaling request");
        self.pending
            .lock()
            .await
            .entry(infra_id)
            .or_default()
            .push(request);
    }

    /// Take every queued request for an infrastructure, in arrival order.
    pub async fn drain(&self, infra_id: InfraId) -> Vec<ScalingRequest> {
        self.pending
            .lock()
            .await
            .remove(&infra_id)
            .unwrap_or_default()
    }

    /// Number of requests waiting for an infrastructure.
    pub async fn pending(&self, infra_id: InfraId) -> usize {
        self.pending
            .lock()
            .await
            .get(&infra_id)
            .map_or(0, Vec::len)
    }

    /// Discard everything queued for an infrastructure.
    pub async fn forget(&self, infra_id: InfraId) {
        self.pending.lock().await.remove(&infra_id);
    }
}

/// Scaling summary of one node, as shown in infrastructure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingReport {
    pub actual: u32,
    pub target: u32,
    pub min: u32,
    pub max: u32,
}

impl ScalingReport {
    pub fn report(node: &NodeDescription, state: Option<&NodeState>) -> Self {
        let actual = state.map_or(0, |s| s.instances.len() as u32);
        let target = state
            .and_then(|s| s.target)
            .unwrap_or(node.scaling.min);
        Self {
            actual,
            target,
            min: node.scaling.min,
            max: node.scaling.max,
        }
    }
}

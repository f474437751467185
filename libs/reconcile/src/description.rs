//! Infrastructure definitions and their compiled form.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use infravisor_id::InfraId;
use serde::{Deserialize, Serialize};

use crate::convergence::SpecHash;

/// An infrastructure definition as submitted by a user.
///
/// Accepted as YAML or JSON:
///
/// ```yaml
/// name: demo
/// nodes:
///   - name: db
///   - name: web
///     depends_on: [db]
///     scaling: { min: 2, max: 5 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InfraDefinition {
    /// Human-readable name of the infrastructure.
    pub name: String,

    /// Nodes making up the infrastructure.
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
}

/// A node as written in a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDefinition {
    pub name: String,

    /// Names of nodes that must be provisioned before this one.
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub scaling: Option<ScalingBounds>,

    /// Opaque attributes forwarded to the resource processor.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// Inclusive bounds on the number of instances of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingBounds {
    pub min: u32,
    pub max: u32,
}

impl Default for ScalingBounds {
    fn default() -> Self {
        Self { min: 1, max: 1 }
    }
}

impl ScalingBounds {
    /// Clamp a requested instance count into the bounds.
    pub fn clamp(&self, count: u32) -> u32 {
        count.clamp(self.min, self.max)
    }

    /// Returns true if `min <= max`.
    pub fn is_valid(&self) -> bool {
        self.min <= self.max
    }
}

/// The compiled, validated and persisted form of an infrastructure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticDescription {
    pub infra_id: InfraId,
    pub name: String,

    /// Nodes in provisioning order: every node comes after its dependencies.
    pub nodes: Vec<NodeDescription>,

    /// Fingerprint of the definition this description was compiled from.
    pub spec_hash: SpecHash,

    pub compiled_at: DateTime<Utc>,
}

impl StaticDescription {
    /// Look up a node by name.
    pub fn node(&self, name: &str) -> Option<&NodeDescription> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

/// A node of a compiled description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    pub name: String,
    pub depends_on: Vec<String>,
    pub scaling: ScalingBounds,
    pub attributes: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaling_bounds_clamp() {
        let bounds = ScalingBounds { min: 2, max: 4 };
        assert_eq!(bounds.clamp(0), 2);
        assert_eq!(bounds.clamp(3), 3);
        assert_eq!(bounds.clamp(10), 4);
        assert!(bounds.is_valid());
        assert!(!ScalingBounds { min: 3, max: 1 }.is_valid());
    }

    #[test]
    fn test_definition_rejects_unknown_fields() {
        let result: Result<InfraDefinition, _> =
            serde_json::from_str(r#"{"name": "x", "nodse": []}"#);
        assert!(result.is_err());
    }
}

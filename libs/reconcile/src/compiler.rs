//! Description compiler.

use std::collections::HashSet;

use chrono::Utc;
use infravisor_id::InfraId;
use thiserror::Error;

use crate::convergence::SpecHash;
use crate::description::{InfraDefinition, NodeDescription, StaticDescription};

/// Reasons a definition cannot be compiled.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("infrastructure definition is empty")]
    Empty,

    #[error("malformed infrastructure definition: {0}")]
    Malformed(String),

    #[error("infrastructure name must not be empty")]
    MissingName,

    #[error("infrastructure defines no nodes")]
    NoNodes,

    #[error("node name must not be empty")]
    UnnamedNode,

    #[error("node '{0}' is defined more than once")]
    DuplicateNode(String),

    #[error("node '{node}' has invalid scaling bounds: min {min} > max {max}")]
    InvalidScaling { node: String, min: u32, max: u32 },

    #[error("node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("dependency cycle between nodes: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),
}

/// Compiles raw infrastructure definitions into static descriptions.
///
/// Compilation assigns the new [`InfraId`]; it never touches storage.
pub trait Compiler: Send + Sync {
    fn compile(&self, raw: &str) -> Result<StaticDescription, CompileError>;
}

/// Compiler for YAML (and therefore JSON) definitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptionCompiler;

impl Compiler for DescriptionCompiler {
    fn compile(&self, raw: &str) -> Result<StaticDescription, CompileError> {
        if raw.trim().is_empty() {
            return Err(CompileError::Empty);
        }

        let definition: InfraDefinition =
            serde_yaml::from_str(raw).map_err(|e| CompileError::Malformed(e.to_string()))?;

        let spec_json =
            serde_json::to_value(&definition).map_err(|e| CompileError::Malformed(e.to_string()))?;
        let spec_hash = SpecHash::from_json(&spec_json);

        let nodes = validate_nodes(&definition)?;

        Ok(StaticDescription {
            infra_id: InfraId::new(),
            name: definition.name.trim().to_string(),
            nodes,
            spec_hash,
            compiled_at: Utc::now(),
        })
    }
}

/// Validate the node list and return it in dependency order.
fn validate_nodes(definition: &InfraDefinition) -> Result<Vec<NodeDescription>, CompileError> {
    if definition.name.trim().is_empty() {
        return Err(CompileError::MissingName);
    }
    if definition.nodes.is_empty() {
        return Err(CompileError::NoNodes);
    }

    let mut names = HashSet::new();
    for node in &definition.nodes {
        if node.name.trim().is_empty() {
            return Err(CompileError::UnnamedNode);
        }
        if !names.insert(node.name.as_str()) {
            return Err(CompileError::DuplicateNode(node.name.clone()));
        }
    }

    let mut compiled = Vec::with_capacity(definition.nodes.len());
    for node in &definition.nodes {
        let scaling = node.scaling.unwrap_or_default();
        if !scaling.is_valid() {
            return Err(CompileError::InvalidScaling {
                node: node.name.clone(),
                min: scaling.min,
                max: scaling.max,
            });
        }
        if let Some(dependency) = node.depends_on.iter().find(|d| !names.contains(d.as_str())) {
            return Err(CompileError::UnknownDependency {
                node: node.name.clone(),
                dependency: dependency.clone(),
            });
        }
        compiled.push(NodeDescription {
            name: node.name.clone(),
            depends_on: node.depends_on.clone(),
            scaling,
            attributes: node.attributes.clone(),
        });
    }

    order_by_dependencies(compiled)
}

/// Stable topological sort: among the nodes whose dependencies are already
/// placed, the one declared first is placed next.
fn order_by_dependencies(
    mut remaining: Vec<NodeDescription>,
) -> Result<Vec<NodeDescription>, CompileError> {
    let mut placed: HashSet<String> = HashSet::new();
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let Some(next) = remaining
            .iter()
            .position(|n| n.depends_on.iter().all(|d| placed.contains(d)))
        else {
            let cycle = remaining.into_iter().map(|n| n.name).collect();
            return Err(CompileError::DependencyCycle(cycle));
        };

        let node = remaining.remove(next);
        placed.insert(node.name.clone());
        ordered.push(node);
    }

    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const DEMO: &str = r#"
name: demo
nodes:
  - name: web
    depends_on: [db]
    scaling: { min: 2, max: 5 }
    attributes:
      image: nginx
  - name: db
"#;

    #[test]
    fn test_compile_orders_nodes_by_dependency() {
        let description = DescriptionCompiler.compile(DEMO).unwrap();

        assert_eq!(description.name, "demo");
        let names: Vec<_> = description.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["db", "web"]);

        let web = description.node("web").unwrap();
        assert_eq!(web.scaling.min, 2);
        assert_eq!(web.scaling.max, 5);
        assert_eq!(web.attributes["image"], serde_json::json!("nginx"));

        let db = description.node("db").unwrap();
        assert_eq!(db.scaling.min, 1);
        assert_eq!(db.scaling.max, 1);
    }

    #[test]
    fn test_compile_accepts_json() {
        let raw = r#"{"name": "json-infra", "nodes": [{"name": "worker"}]}"#;
        let description = DescriptionCompiler.compile(raw).unwrap();
        assert_eq!(description.nodes.len(), 1);
    }

    #[test]
    fn test_each_compilation_assigns_a_new_id() {
        let first = DescriptionCompiler.compile(DEMO).unwrap();
        let second = DescriptionCompiler.compile(DEMO).unwrap();

        assert_ne!(first.infra_id, second.infra_id);
        assert_eq!(first.spec_hash, second.spec_hash);
    }

    #[rstest]
    #[case::blank("   \n", CompileError::Empty)]
    #[case::no_name("name: ''\nnodes: [{name: a}]", CompileError::MissingName)]
    #[case::no_nodes("name: x", CompileError::NoNodes)]
    #[case::duplicate(
        "name: x\nnodes: [{name: a}, {name: a}]",
        CompileError::DuplicateNode("a".into())
    )]
    #[case::bad_bounds(
        "name: x\nnodes: [{name: a, scaling: {min: 3, max: 1}}]",
        CompileError::InvalidScaling { node: "a".into(), min: 3, max: 1 }
    )]
    #[case::unknown_dependency(
        "name: x\nnodes: [{name: a, depends_on: [b]}]",
        CompileError::UnknownDependency { node: "a".into(), dependency: "b".into() }
    )]
    #[case::cycle(
        "name: x\nnodes: [{name: a, depends_on: [b]}, {name: b, depends_on: [a]}]",
        CompileError::DependencyCycle(vec!["a".into(), "b".into()])
    )]
    fn test_compile_rejects_invalid_definitions(#[case] raw: &str, #[case] expected: CompileError) {
        assert_eq!(DescriptionCompiler.compile(raw).unwrap_err(), expected);
    }

    #[test]
    fn test_compile_rejects_malformed_yaml() {
        let err = DescriptionCompiler.compile("name: [unterminated").unwrap_err();
        assert!(matches!(err, CompileError::Malformed(_)));
    }
}

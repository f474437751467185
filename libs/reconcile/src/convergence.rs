//! Convergence helpers shared by the planner and the reports.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Convergence status of an infrastructure after a reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    /// Observed state matches the description; nothing was issued.
    Converged,

    /// Instructions were issued; the next pass will tell whether they stuck.
    #[default]
    Converging,
}

impl ConvergenceStatus {
    /// Returns true if the infrastructure has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

/// A content fingerprint of an infrastructure definition.
///
/// Two definitions that differ only in key order hash identically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16])))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", serde_json::Value::from(k.as_str()), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// Drain selection priority for node instances.
///
/// Lower priority values are dropped first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DrainPriority {
    /// Instance has failed.
    Failed = 0,

    /// Instance is still being provisioned.
    NotReady = 1,

    /// Instance is ready; among these the oldest goes first.
    Oldest = 2,
}

/// Order instances for dropping.
///
/// The sort is stable, so instances with equal priority keep their input
/// order. Callers pass instances oldest-first.
pub fn select_for_drain<T, F>(instances: Vec<T>, get_priority: F) -> Vec<T>
where
    F: Fn(&T) -> DrainPriority,
{
    let mut with_priority: Vec<_> = instances
        .into_iter()
        .map(|i| {
            let p = get_priority(&i);
            (p, i)
        })
        .collect();

    with_priority.sort_by_key(|(p, _)| *p);
    with_priority.into_iter().map(|(_, i)| i).collect()
}

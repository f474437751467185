//! Keyed information queries.
//!
//! Keys are dotted names (`infrastructure.state`); parameters are a flat
//! string map taken from the query string.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use infravisor_id::InfraId;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::scaling::ScalingReport;
use crate::store::InfraStore;

/// Query parameters.
pub type InfoParams = BTreeMap<String, String>;

/// Info query errors.
#[derive(Debug, Error)]
pub enum InfoError {
    /// A parameter is missing or has an invalid value.
    #[error("invalid parameter value for key \"{key}\": {message}")]
    Argument { key: String, message: String },

    /// No provider serves the key.
    #[error("key not found: \"{0}\"")]
    KeyNotFound(String),

    /// The provider failed while answering.
    #[error("provider for key \"{key}\" failed: {message}")]
    Provider { key: String, message: String },
}

/// Answers info queries.
#[async_trait]
pub trait InfoBroker: Send + Sync {
    async fn get(&self, key: &str, params: &InfoParams) -> Result<Value, InfoError>;
}

/// Serves a fixed set of keys.
#[async_trait]
pub trait InfoProvider: Send + Sync {
    fn keys(&self) -> &'static [&'static str];

    async fn get(&self, key: &str, params: &InfoParams) -> Result<Value, InfoError>;
}

/// Broker that routes each key to the provider registered for it.
#[derive(Default)]
pub struct InfoRouter {
    routes: HashMap<&'static str, Arc<dyn InfoProvider>>,
}

impl InfoRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider for all of its keys. Later registrations win.
    pub fn with_provider(mut self, provider: Arc<dyn InfoProvider>) -> Self {
        for key in provider.keys() {
            self.routes.insert(*key, Arc::clone(&provider));
        }
        self
    }

    /// All routed keys, sorted.
    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<_> = self.routes.keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

#[async_trait]
impl InfoBroker for InfoRouter {
    async fn get(&self, key: &str, params: &InfoParams) -> Result<Value, InfoError> {
        let provider = self
            .routes
            .get(key)
            .ok_or_else(|| InfoError::KeyNotFound(key.to_string()))?;
        debug!(key = %key, "Routing info query");
        provider.get(key, params).await
    }
}

/// Infrastructure information read from the store.
pub struct StoreInfoProvider {
    store: Arc<dyn InfraStore>,
}

impl StoreInfoProvider {
    pub const STATE: &'static str = "infrastructure.state";
    pub const STATIC_DESCRIPTION: &'static str = "infrastructure.static_description";
    pub const SCALING: &'static str = "infrastructure.scaling";

    pub fn new(store: Arc<dyn InfraStore>) -> Self {
        Self { store }
    }

    fn infra_id(key: &str, params: &InfoParams) -> Result<InfraId, InfoError> {
        let raw = params.get("infra_id").ok_or_else(|| InfoError::Argument {
            key: key.to_string(),
            message: "missing parameter 'infra_id'".to_string(),
        })?;
        raw.parse().map_err(|e| InfoError::Argument {
            key: key.to_string(),
            message: format!("invalid infra_id: {e}"),
        })
    }
}

fn provider_error(key: &str, err: impl std::fmt::Display) -> InfoError {
    InfoError::Provider {
        key: key.to_string(),
        message: err.to_string(),
    }
}

#[async_trait]
impl InfoProvider for StoreInfoProvider {
    fn keys(&self) -> &'static [&'static str] {
        &[Self::STATE, Self::STATIC_DESCRIPTION, Self::SCALING]
    }

    async fn get(&self, key: &str, params: &InfoParams) -> Result<Value, InfoError> {
        let infra_id = Self::infra_id(key, params)?;
        let description = self
            .store
            .get_infrastructure(infra_id)
            .await
            .map_err(|e| provider_error(key, e))?
            .ok_or_else(|| InfoError::Argument {
                key: key.to_string(),
                message: format!("unknown infrastructure {infra_id}"),
            })?;

        match key {
            Self::STATIC_DESCRIPTION => {
                serde_json::to_value(&description).map_err(|e| provider_error(key, e))
            }
            Self::STATE => {
                let state = self
                    .store
                    .dynamic_state(infra_id)
                    .await
                    .map_err(|e| provider_error(key, e))?;
                serde_json::to_value(&state).map_err(|e| provider_error(key, e))
            }
            Self::SCALING => {
                let state = self
                    .store
                    .dynamic_state(infra_id)
                    .await
                    .map_err(|e| provider_error(key, e))?;
                let reports: BTreeMap<_, _> = description
                    .nodes
                    .iter()
                    .map(|n| (n.name.clone(), ScalingReport::report(n, state.node(&n.name))))
                    .collect();
                serde_json::to_value(&reports).map_err(|e| provider_error(key, e))
            }
            other => Err(InfoError::KeyNotFound(other.to_string())),
        }
    }
}

/// Diagnostic provider that returns its parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoInfoProvider;

impl EchoInfoProvider {
    pub const ECHO: &'static str = "global.echo";
}

#[async_trait]
impl InfoProvider for EchoInfoProvider {
    fn keys(&self) -> &'static [&'static str] {
        &[Self::ECHO]
    }

    async fn get(&self, _key: &str, params: &InfoParams) -> Result<Value, InfoError> {
        Ok(json!(params))
    }
}

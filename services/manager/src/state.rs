//! Application state shared across request handlers.

use std::sync::Arc;

use infravisor_reconcile::{InfoBroker, InfraStore, ScalingQueue};

use crate::lifecycle::LifecycleManager;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    manager: Arc<LifecycleManager>,
    info: Arc<dyn InfoBroker>,
}

impl AppState {
    /// Create a new application state.
    pub fn new(manager: Arc<LifecycleManager>, info: Arc<dyn InfoBroker>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { manager, info }),
        }
    }

    pub fn manager(&self) -> &LifecycleManager {
        &self.inner.manager
    }

    pub fn info(&self) -> &dyn InfoBroker {
        self.inner.info.as_ref()
    }

    pub fn store(&self) -> &dyn InfraStore {
        self.inner.manager.context().store.as_ref()
    }

    pub fn scaling(&self) -> &ScalingQueue {
        &self.inner.manager.context().scaling
    }
}

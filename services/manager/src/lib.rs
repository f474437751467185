//! infravisor lifecycle manager library.
//!
//! This crate primarily ships an `infra-manager` binary, but exposes its
//! library surface for integration testing and embedding.

pub mod api;
pub mod config;
pub mod lifecycle;
pub mod state;

use std::sync::Arc;

use infravisor_reconcile::{EchoInfoProvider, InfoRouter, StoreInfoProvider};

use crate::lifecycle::ManagerContext;

/// The info broker served by `/info/{key}`.
pub fn default_info_router(ctx: &ManagerContext) -> InfoRouter {
    InfoRouter::new()
        .with_provider(Arc::new(StoreInfoProvider::new(Arc::clone(&ctx.store))))
        .with_provider(Arc::new(EchoInfoProvider))
}

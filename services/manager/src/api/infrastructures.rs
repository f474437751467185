//! Infrastructure lifecycle endpoints.
//!
//! The collection routes are served both with and without a trailing slash.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use infravisor_id::{InfraId, NodeInstanceId};
use infravisor_reconcile::{InstanceState, ScalingReport, StaticDescription};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use super::error::ApiError;
use crate::lifecycle::TerminationOutcome;
use crate::state::AppState;

/// Create infrastructure routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/infrastructures", get(list_infrastructures).post(create_infrastructure))
        .route("/infrastructures/", get(list_infrastructures).post(create_infrastructure))
        .route(
            "/infrastructures/{infra_id}",
            get(get_infrastructure).delete(delete_infrastructure),
        )
        .route("/infrastructures/{infra_id}/attach", post(attach_infrastructure))
        .route("/infrastructures/{infra_id}/detach", post(detach_infrastructure))
        .route("/infrastructures/{infra_id}/scaleup/{node}", post(scale_up))
        .route("/infrastructures/{infra_id}/scaleup/{node}/{count}", post(scale_up_count))
        .route("/infrastructures/{infra_id}/scaledown/{node}", post(scale_down))
        .route("/infrastructures/{infra_id}/scaledown/{node}/{node_id}", post(scale_down_instance))
}

// =============================================================================
// Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct InfraIdResponse {
    pub infraid: InfraId,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub infrastructures: Vec<InfraId>,
}

#[derive(Debug, Serialize)]
pub struct DetachResponse {
    pub infraid: InfraId,
    pub outcome: TerminationOutcome,
    pub elapsed_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct InfraReport {
    pub infraid: InfraId,
    pub name: String,
    pub managed: bool,
    pub nodes: BTreeMap<String, NodeReport>,
}

#[derive(Debug, Serialize)]
pub struct NodeReport {
    pub instances: BTreeMap<String, InstanceReport>,
    pub scaling: ScalingReport,
}

#[derive(Debug, Serialize)]
pub struct InstanceReport {
    pub resource_address: Option<String>,
    pub state: InstanceState,
}

// =============================================================================
// Helpers
// =============================================================================

fn parse_infra_id(raw: &str) -> Result<InfraId, ApiError> {
    raw.parse().map_err(|e| {
        ApiError::bad_request("invalid_infra_id", format!("invalid infrastructure id '{raw}': {e}"))
    })
}

fn store_failure(err: impl std::fmt::Display) -> ApiError {
    ApiError::internal("request_failed", err.to_string())
}

/// Fetch the description and make sure `node` is part of it.
async fn described_node(
    state: &AppState,
    infra_id: InfraId,
    node: &str,
) -> Result<StaticDescription, ApiError> {
    let description = state.manager().description(infra_id).await?;
    if description.node(node).is_none() {
        return Err(ApiError::not_found(
            "node_not_found",
            format!("infrastructure {infra_id} has no node '{node}'"),
        ));
    }
    Ok(description)
}

// =============================================================================
// Handlers
// =============================================================================

async fn create_infrastructure(
    State(state): State<AppState>,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    if body.trim().is_empty() {
        return Err(ApiError::bad_request(
            "empty_body",
            "request body must contain an infrastructure description",
        ));
    }

    let infraid = state.manager().add(&body).await?;
    Ok((StatusCode::CREATED, Json(InfraIdResponse { infraid })))
}

async fn list_infrastructures(State(state): State<AppState>) -> Json<ListResponse> {
    Json(ListResponse {
        infrastructures: state.manager().list().await,
    })
}

async fn get_infrastructure(
    State(state): State<AppState>,
    Path(infra_id): Path<String>,
) -> Result<Json<InfraReport>, ApiError> {
    let infra_id = parse_infra_id(&infra_id)?;
    let description = state.manager().description(infra_id).await?;
    let dynamic = state
        .store()
        .dynamic_state(infra_id)
        .await
        .map_err(store_failure)?;

    let nodes = description
        .nodes
        .iter()
        .map(|node| {
            let node_state = dynamic.node(&node.name);
            let instances = node_state
                .into_iter()
                .flat_map(|s| s.instances.values())
                .map(|i| {
                    (
                        i.node_id.to_string(),
                        InstanceReport {
                            resource_address: i.resource_address.clone(),
                            state: i.state,
                        },
                    )
                })
                .collect();
            let report = NodeReport {
                instances,
                scaling: ScalingReport::report(node, node_state),
            };
            (node.name.clone(), report)
        })
        .collect();

    Ok(Json(InfraReport {
        infraid: infra_id,
        name: description.name,
        managed: state.manager().is_managed(infra_id).await,
        nodes,
    }))
}

/// Detach (if managed), then tear down.
async fn delete_infrastructure(
    State(state): State<AppState>,
    Path(infra_id): Path<String>,
) -> Result<Json<InfraIdResponse>, ApiError> {
    let infra_id = parse_infra_id(&infra_id)?;
    let manager = state.manager();
    manager.description(infra_id).await?;

    if manager.is_managed(infra_id).await {
        match manager.detach(infra_id).await {
            Ok(report) => info!(
                infra_id = %infra_id,
                outcome = ?report.outcome,
                "Detached before teardown"
            ),
            // Somebody else detached it in the meantime.
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }

    manager.tear_down(infra_id).await?;
    Ok(Json(InfraIdResponse { infraid: infra_id }))
}

async fn attach_infrastructure(
    State(state): State<AppState>,
    Path(infra_id): Path<String>,
) -> Result<Json<InfraIdResponse>, ApiError> {
    let infra_id = parse_infra_id(&infra_id)?;
    state.manager().attach(infra_id).await?;
    Ok(Json(InfraIdResponse { infraid: infra_id }))
}

async fn detach_infrastructure(
    State(state): State<AppState>,
    Path(infra_id): Path<String>,
) -> Result<Json<DetachResponse>, ApiError> {
    let infra_id = parse_infra_id(&infra_id)?;
    let report = state.manager().detach(infra_id).await?;
    Ok(Json(DetachResponse {
        infraid: infra_id,
        outcome: report.outcome,
        elapsed_ms: report.elapsed.as_millis() as u64,
    }))
}

async fn scale_up(
    State(state): State<AppState>,
    Path((infra_id, node)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    enqueue_scale_up(&state, &infra_id, &node, "1").await
}

async fn scale_up_count(
    State(state): State<AppState>,
    Path((infra_id, node, count)): Path<(String, String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    enqueue_scale_up(&state, &infra_id, &node, &count).await
}

async fn enqueue_scale_up(
    state: &AppState,
    infra_id: &str,
    node: &str,
    count: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let infra_id = parse_infra_id(infra_id)?;
    let count = count
        .parse::<u32>()
        .ok()
        .filter(|c| *c > 0)
        .ok_or_else(|| {
            ApiError::bad_request(
                "invalid_count",
                format!("count must be a positive integer, got '{count}'"),
            )
        })?;
    described_node(state, infra_id, node).await?;

    state.scaling().add_create_request(infra_id, node, count).await;
    Ok(Json(json!({
        "method": "scaleup",
        "infraid": infra_id,
        "nodename": node,
        "count": count,
    })))
}

async fn scale_down(
    State(state): State<AppState>,
    Path((infra_id, node)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    enqueue_scale_down(&state, &infra_id, &node, None).await
}

async fn scale_down_instance(
    State(state): State<AppState>,
    Path((infra_id, node, node_id)): Path<(String, String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    enqueue_scale_down(&state, &infra_id, &node, Some(&node_id)).await
}

async fn enqueue_scale_down(
    state: &AppState,
    infra_id: &str,
    node: &str,
    node_id: Option<&str>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let infra_id = parse_infra_id(infra_id)?;
    described_node(state, infra_id, node).await?;

    let node_id = match node_id {
        None => None,
        Some(raw) => {
            let node_id: NodeInstanceId = raw.parse().map_err(|e| {
                ApiError::bad_request("invalid_node_id", format!("invalid node id '{raw}': {e}"))
            })?;
            let dynamic = state
                .store()
                .dynamic_state(infra_id)
                .await
                .map_err(store_failure)?;
            let exists = dynamic
                .node(node)
                .is_some_and(|s| s.instances.contains_key(&node_id));
            if !exists {
                return Err(ApiError::not_found(
                    "node_instance_not_found",
                    format!("node '{node}' has no instance {node_id}"),
                ));
            }
            Some(node_id)
        }
    };

    state.scaling().add_drop_request(infra_id, node, node_id).await;
    Ok(Json(json!({
        "method": "scaledown",
        "infraid": infra_id,
        "nodename": node,
        "nodeid": node_id,
    })))
}

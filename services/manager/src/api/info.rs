//! Info broker endpoint.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use infravisor_reconcile::InfoParams;
use serde::Serialize;

use super::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/info/{key}", get(get_info))
}

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub result: serde_json::Value,
}

/// Answer `key` with the query string as parameters.
async fn get_info(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<InfoParams>,
) -> Result<Json<InfoResponse>, ApiError> {
    let result = state.info().get(&key, &params).await?;
    Ok(Json(InfoResponse { result }))
}

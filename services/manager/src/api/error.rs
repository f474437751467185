use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use infravisor_reconcile::InfoError;
use serde::Serialize;
use tracing::warn;

use crate::lifecycle::ManagerError;

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://infravisor.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::SERVICE_UNAVAILABLE, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        let message = err.to_string();
        match err {
            ManagerError::NotFound { .. } => Self::not_found("infrastructure_not_found", message),
            ManagerError::AlreadyManaged { .. } => Self::conflict("already_managed", message),
            ManagerError::StillManaged { .. } => Self::conflict("still_managed", message),
            ManagerError::Compilation(_) => Self::bad_request("invalid_description", message),
            ManagerError::ShuttingDown { .. } => Self::unavailable("shutting_down", message),
            ManagerError::Store { .. } | ManagerError::Teardown { .. } => {
                warn!(error = %message, "Lifecycle operation failed");
                Self::internal("request_failed", message)
            }
        }
    }
}

impl From<InfoError> for ApiError {
    fn from(err: InfoError) -> Self {
        match err {
            InfoError::Argument { key, message } => {
                Self::bad_request(
                    "invalid_parameter",
                    format!("Invalid parameter value for key \"{key}\": {message}"),
                )
            }
            InfoError::KeyNotFound(key) => {
                Self::not_found("key_not_found", format!("Key not found: \"{key}\""))
            }
            err @ InfoError::Provider { .. } => Self::internal("request_failed", err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

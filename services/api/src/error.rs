//! services/api/src/error.rs
//!
//! Defines the primary error type for the entire API service, and how it is
//! rendered as an HTTP response: `{"error":{"code","message"}}`.

use crate::config::ConfigError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use deal_desk_core::{lifecycle::LifecycleError, ports::PortError};
use serde::Serialize;
use tracing::error;
use utoipa::ToSchema;

/// The primary error type for the `api` service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Represents an error that propagated up from one of the core service ports.
    #[error("Service Port Error: {0}")]
    Port(#[from] PortError),

    /// A deal operation refused by the lifecycle rules.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Represents an error from the underlying database library.
    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration Error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Represents a standard Input/Output error (e.g., binding to a network socket).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    BadRequest(String),

    #[error("Authentication required")]
    Unauthorized,

    /// A catch-all for any other unexpected errors.
    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}

/// Body of every error response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

impl ApiError {
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Lifecycle(e) => lifecycle_status(e),
            ApiError::Port(e) => port_status(e),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Config(_)
            | ApiError::Database(_)
            | ApiError::Migration(_)
            | ApiError::Io(_)
            | ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

fn lifecycle_status(e: &LifecycleError) -> (StatusCode, &'static str) {
    match e {
        LifecycleError::NotFound(_) => (StatusCode::NOT_FOUND, "deal_not_found"),
        LifecycleError::UnknownManager(_) => (StatusCode::NOT_FOUND, "manager_not_found"),
        LifecycleError::AlreadyClaimed => (StatusCode::CONFLICT, "already_claimed"),
        LifecycleError::DealClosed => (StatusCode::CONFLICT, "deal_closed"),
        LifecycleError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
        LifecycleError::NotAssignee => (StatusCode::FORBIDDEN, "not_assignee"),
        LifecycleError::InvalidStatusTransition { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "invalid_status_transition")
        }
        LifecycleError::Conflict => (StatusCode::CONFLICT, "conflict"),
        LifecycleError::InvalidRating(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_rating"),
        LifecycleError::NotClosed => (StatusCode::CONFLICT, "not_closed"),
        LifecycleError::AlreadyRated => (StatusCode::CONFLICT, "already_rated"),
        LifecycleError::AnalysisUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "analysis_unavailable")
        }
        LifecycleError::Port(p) => port_status(p),
    }
}

fn port_status(e: &PortError) -> (StatusCode, &'static str) {
    match e {
        PortError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        PortError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
        PortError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
        PortError::Unexpected(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = if status.is_server_error() {
            error!("Request failed: {:?}", self);
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };
        (status, Json(ErrorBody::new(code, message))).into_response()
    }
}

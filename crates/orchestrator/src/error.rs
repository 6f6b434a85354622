//! Error types for the QueryGraph orchestrator.
//!
//! `AppError` implements `IntoResponse` for Axum handlers. Node-level and
//! collaborator-level failures have their own enums so the engine can turn
//! them into `node_error` events instead of HTTP errors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-level errors.
#[derive(Error, Debug)]
pub enum AppError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Not found error
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict error (e.g., execution not in the expected state)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Bad request error
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Durable store error (interrupt persistence)
    #[error("Store error: {0}")]
    Store(String),

    /// External service error
    #[error("External service error: {0}")]
    ExternalService(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
            AppError::Config(msg) => {
                tracing::error!(error = %msg, "Configuration error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
            AppError::Serialization(e) => {
                tracing::error!(error = %e, "Serialization error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::Store(msg) => {
                tracing::error!(error = %msg, "Store error");
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone())
            }
            AppError::ExternalService(msg) => {
                tracing::warn!(error = %msg, "External service error");
                (StatusCode::BAD_GATEWAY, msg.clone())
            }
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<envy::Error> for AppError {
    fn from(err: envy::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

/// Errors raised by external collaborators (retriever, tool backend, ...).
#[derive(Error, Debug)]
pub enum CollaboratorError {
    /// The collaborator is not reachable or not configured.
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    /// The collaborator answered with a failure.
    #[error("Collaborator failed: {0}")]
    Failed(String),

    /// The call exceeded the configured timeout (milliseconds).
    #[error("Collaborator call timed out after {0} ms")]
    Timeout(u64),

    /// The response could not be decoded.
    #[error("Invalid collaborator response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            CollaboratorError::Unavailable(e.to_string())
        } else if e.is_decode() {
            CollaboratorError::InvalidResponse(e.to_string())
        } else {
            CollaboratorError::Failed(e.to_string())
        }
    }
}

impl From<serde_json::Error> for CollaboratorError {
    fn from(e: serde_json::Error) -> Self {
        CollaboratorError::InvalidResponse(e.to_string())
    }
}

/// Violations of the workflow state invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// A set-once stage field was written twice.
    #[error("Field '{0}' is already populated")]
    AlreadySet(&'static str),

    /// A diagnostic extension key was written twice.
    #[error("Extension '{0}' is already populated")]
    ExtensionExists(String),

    /// An override path does not name a field of the state.
    #[error("Unknown state field: {0}")]
    UnknownField(String),

    /// An override path names a field managed by the engine.
    #[error("Field '{0}' cannot be overridden")]
    ProtectedField(String),

    /// The snapshot was written by an incompatible state version.
    #[error("Unsupported state version {found} (expected at most {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// The state could not be (de)serialized.
    #[error("State serialization failed: {0}")]
    Serialization(String),
}

/// Errors returned by workflow nodes.
#[derive(Error, Debug)]
pub enum NodeError {
    /// An external collaborator call failed.
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// The node tried to break a state invariant.
    #[error(transparent)]
    State(#[from] StateError),

    /// An upstream stage output the node depends on is missing.
    #[error("Missing input: {0}")]
    MissingInput(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = AppError::NotFound("no suspended execution abc".to_string());
        assert_eq!(
            err.to_string(),
            "Resource not found: no suspended execution abc"
        );
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let response = AppError::NotFound("x".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_node_error_display() {
        let err = NodeError::from(CollaboratorError::Timeout(30_000));
        assert_eq!(err.to_string(), "Collaborator call timed out after 30000 ms");

        let err = NodeError::from(StateError::AlreadySet("answer"));
        assert_eq!(err.to_string(), "Field 'answer' is already populated");
    }
}

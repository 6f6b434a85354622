//! Query submission.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::engine::{ExecutionResult, ExecutionStatus, QueryOptions, Submission, WorkflowState};
use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub datasource_ref: Option<String>,
    pub client_id: String,
    #[serde(default)]
    pub options: Option<QueryOptions>,
}

/// Outcome of a run: completed, failed, cancelled or suspended.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResponse {
    pub execution_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub result: WorkflowState,
}

impl From<ExecutionResult> for ExecutionResponse {
    fn from(result: ExecutionResult) -> Self {
        Self {
            execution_id: result.execution_id,
            status: result.status,
            answer: result.state.answer.clone(),
            result: result.state,
        }
    }
}

/// Submit a query and wait until it completes or suspends.
///
/// POST /api/query
pub async fn submit_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> AppResult<Json<ExecutionResponse>> {
    if request.query.trim().is_empty() {
        return Err(AppError::Validation("query must not be empty".to_string()));
    }
    if request.client_id.trim().is_empty() {
        return Err(AppError::Validation("client_id must not be empty".to_string()));
    }

    let result = state
        .engine
        .submit(Submission {
            query: request.query,
            datasource_ref: request.datasource_ref,
            client_id: request.client_id,
            options: request.options,
        })
        .await;

    Ok(Json(result.into()))
}

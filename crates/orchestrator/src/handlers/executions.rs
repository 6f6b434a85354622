//! Execution inspection and REST mirrors of the control messages.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::models::{HistoryEntry, InterruptRecord, ParameterAdjustment};
use crate::engine::{CancelOutcome, ExecutionSnapshot, NodeName};
use crate::error::{AppError, AppResult};
use crate::hitl::SuspensionKind;
use crate::registry::SuspendRequest;
use crate::state::AppState;

use super::query::ExecutionResponse;

const REST_INITIATOR: &str = "api";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SuspendBody {
    #[serde(default)]
    pub reason: Option<String>,
    /// Suspend only before this node.
    #[serde(default)]
    pub node_name: Option<NodeName>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResumeBody {
    /// Overrides keyed by dotted state path, e.g. `options.output_format`.
    #[serde(default)]
    pub parameters: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Subscriber that should receive the resumed execution's events.
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlResponse {
    pub execution_id: String,
    pub status: String,
}

/// Summary of an interrupt record without its state blob.
#[derive(Debug, Clone, Serialize)]
pub struct InterruptSummary {
    pub execution_id: String,
    pub user_input: String,
    pub datasource_ref: Option<String>,
    pub interrupt_node: String,
    pub interrupt_reason: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<InterruptRecord> for InterruptSummary {
    fn from(record: InterruptRecord) -> Self {
        Self {
            execution_id: record.execution_id,
            user_input: record.user_input,
            datasource_ref: record.datasource_ref,
            interrupt_node: record.interrupt_node,
            interrupt_reason: record.interrupt_reason,
            created_at: record.created_at,
        }
    }
}

/// Last known state of an execution.
///
/// GET /api/executions/{execution_id}
pub async fn get(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> AppResult<Json<ExecutionSnapshot>> {
    state
        .engine
        .snapshot(&execution_id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Execution {} not found", execution_id)))
}

/// GET /api/executions/{execution_id}/history
pub async fn history(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> AppResult<Json<Vec<HistoryEntry>>> {
    Ok(Json(state.engine.hitl().history(&execution_id).await?))
}

/// GET /api/executions/{execution_id}/adjustments
pub async fn adjustments(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> AppResult<Json<Vec<ParameterAdjustment>>> {
    Ok(Json(state.engine.hitl().adjustments(&execution_id).await?))
}

/// Durable interrupts waiting for a resume.
///
/// GET /api/interrupts
pub async fn list_interrupts(State(state): State<AppState>) -> AppResult<Json<Vec<InterruptSummary>>> {
    let records = state.engine.hitl().active_interrupts().await?;
    Ok(Json(records.into_iter().map(InterruptSummary::from).collect()))
}

async fn request_suspend(
    state: &AppState,
    execution_id: String,
    kind: SuspensionKind,
    body: SuspendBody,
) -> AppResult<Json<ControlResponse>> {
    state
        .engine
        .request_suspend(
            &execution_id,
            SuspendRequest {
                kind,
                reason: body.reason,
                initiator: REST_INITIATOR.to_string(),
                before: body.node_name,
            },
        )
        .await?;
    Ok(Json(ControlResponse {
        execution_id,
        status: format!("{}_requested", kind),
    }))
}

/// POST /api/executions/{execution_id}/pause
pub async fn pause(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    body: Option<Json<SuspendBody>>,
) -> AppResult<Json<ControlResponse>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    request_suspend(&state, execution_id, SuspensionKind::Pause, body).await
}

/// POST /api/executions/{execution_id}/interrupt
pub async fn interrupt(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    body: Option<Json<SuspendBody>>,
) -> AppResult<Json<ControlResponse>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    request_suspend(&state, execution_id, SuspensionKind::Interrupt, body).await
}

/// Resume and wait until the execution completes or suspends again.
///
/// POST /api/executions/{execution_id}/resume
pub async fn resume(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    body: Option<Json<ResumeBody>>,
) -> AppResult<Json<ExecutionResponse>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let result = state
        .engine
        .resume(
            &execution_id,
            body.parameters.as_ref(),
            body.reason.as_deref(),
            body.client_id.as_deref(),
            REST_INITIATOR,
        )
        .await?;
    Ok(Json(result.into()))
}

/// POST /api/executions/{execution_id}/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> AppResult<Json<ControlResponse>> {
    let status = match state.engine.cancel(&execution_id, REST_INITIATOR).await? {
        CancelOutcome::Requested => "cancel_requested",
        CancelOutcome::Cancelled => "cancelled",
    };
    Ok(Json(ControlResponse {
        execution_id,
        status: status.to_string(),
    }))
}

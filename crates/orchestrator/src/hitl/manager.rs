//! HITL state manager.
//!
//! Owns the pause table and the interrupt store, applies human overrides
//! on resume and writes the adjustment and history audit rows.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::db::models::{
    HistoryEntry, InterruptRecord, InterruptStatus, NewInterrupt, OperationType, ParameterAdjustment,
};
use crate::engine::state::{HitlStatus, NodeName, WorkflowState};
use crate::error::{AppResult, StateError};
use crate::result_ext::ResultExt;

use super::pause::{PauseRecord, PauseTable};
use super::store::InterruptStore;
use super::{RetentionPolicy, SuspensionKind};

/// A state released from suspension, ready to re-enter the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Resumed {
    pub kind: SuspensionKind,
    pub state: WorkflowState,
    /// Node recorded at suspension time.
    pub node: NodeName,
    pub adjustments: Vec<ParameterAdjustment>,
}

/// Result of [`HitlManager::resume`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    Resumed(Box<Resumed>),
    /// No pause and no `interrupted` record exists for the execution.
    NotFound,
    /// An override was invalid; the suspension is left untouched.
    Rejected(String),
    /// The store failed or the snapshot could not be restored.
    Failed(String),
}

/// What a cleanup pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired_pauses: Vec<String>,
    pub interrupts_purged: u64,
}

pub struct HitlManager {
    pauses: PauseTable,
    store: Arc<dyn InterruptStore>,
}

impl HitlManager {
    pub fn new(store: Arc<dyn InterruptStore>) -> Self {
        Self {
            pauses: PauseTable::new(),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn InterruptStore> {
        &self.store
    }

    /// Keep `state` in the pause table. A previous pause of the execution is replaced.
    pub async fn pause(
        &self,
        execution_id: &str,
        state: &WorkflowState,
        node: NodeName,
        reason: Option<&str>,
        initiator: &str,
    ) -> bool {
        self.pauses
            .insert(PauseRecord {
                execution_id: execution_id.to_string(),
                state: state.clone(),
                node,
                reason: reason.map(str::to_string),
                created_at: Utc::now(),
            })
            .await;

        info!(execution_id = %execution_id, node = %node, "Execution paused");
        self.record_history(
            execution_id,
            OperationType::Pause,
            Some(node),
            json!({ "reason": reason }),
            initiator,
        )
        .await;
        true
    }

    /// Persist `state` as a durable interrupt. Returns `false` if the store
    /// rejected the write.
    pub async fn interrupt(
        &self,
        execution_id: &str,
        state: &WorkflowState,
        node: NodeName,
        reason: Option<&str>,
        initiator: &str,
    ) -> bool {
        let state_blob = match state.to_snapshot() {
            Ok(blob) => blob,
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "Failed to serialize state for interrupt");
                return false;
            }
        };

        let new = NewInterrupt {
            execution_id: execution_id.to_string(),
            user_input: state.query.clone(),
            datasource_ref: state.datasource_ref.clone(),
            interrupt_node: node,
            interrupt_reason: reason.map(str::to_string),
            state_blob,
        };
        if let Err(e) = self.store.save_interrupt(new).await {
            warn!(execution_id = %execution_id, error = %e, "Failed to persist interrupt");
            return false;
        }

        info!(execution_id = %execution_id, node = %node, "Execution interrupted");
        self.record_history(
            execution_id,
            OperationType::Interrupt,
            Some(node),
            json!({ "reason": reason }),
            initiator,
        )
        .await;
        true
    }

    /// Release a suspended execution, applying `overrides` (dotted state
    /// paths to new values). Pauses are checked before interrupts.
    pub async fn resume(
        &self,
        execution_id: &str,
        overrides: Option<&BTreeMap<String, Value>>,
        reason: Option<&str>,
        initiator: &str,
    ) -> ResumeOutcome {
        if let Some(record) = self.pauses.get(execution_id).await {
            return self.resume_pause(record, overrides, reason, initiator).await;
        }

        let record = match self.store.load_interrupt(execution_id).await {
            Ok(Some(record)) if record.status() == Some(InterruptStatus::Interrupted) => record,
            Ok(_) => return ResumeOutcome::NotFound,
            Err(e) => return ResumeOutcome::Failed(e.to_string()),
        };
        self.resume_interrupt(record, overrides, reason, initiator).await
    }

    async fn resume_pause(
        &self,
        record: PauseRecord,
        overrides: Option<&BTreeMap<String, Value>>,
        reason: Option<&str>,
        initiator: &str,
    ) -> ResumeOutcome {
        let execution_id = record.execution_id.as_str();
        let (mut state, adjustments) = match apply_overrides(&record.state, execution_id, overrides, reason) {
            Ok(applied) => applied,
            Err(e) => return ResumeOutcome::Rejected(e.to_string()),
        };

        // A concurrent resume or cancel may have taken the record meanwhile.
        if self.pauses.remove(execution_id).await.is_none() {
            return ResumeOutcome::NotFound;
        }
        mark_resumed(&mut state);

        if !adjustments.is_empty() {
            let _ = self
                .store
                .record_adjustments(&adjustments)
                .await
                .log(format!("recording parameter adjustments for {}", execution_id));
        }
        self.record_history(
            execution_id,
            OperationType::Resume,
            Some(record.node),
            json!({ "kind": SuspensionKind::Pause, "overrides": overrides }),
            initiator,
        )
        .await;

        info!(execution_id = %execution_id, adjustments = adjustments.len(), "Paused execution resumed");
        ResumeOutcome::Resumed(Box::new(Resumed {
            kind: SuspensionKind::Pause,
            state,
            node: record.node,
            adjustments,
        }))
    }

    async fn resume_interrupt(
        &self,
        record: InterruptRecord,
        overrides: Option<&BTreeMap<String, Value>>,
        reason: Option<&str>,
        initiator: &str,
    ) -> ResumeOutcome {
        let execution_id = record.execution_id.as_str();
        let node = match record.node() {
            Ok(node) => node,
            Err(e) => return ResumeOutcome::Failed(e.to_string()),
        };
        let snapshot = match WorkflowState::from_snapshot(record.state_blob.clone()) {
            Ok(state) => state,
            Err(e) => return ResumeOutcome::Failed(e.to_string()),
        };
        let (mut state, adjustments) = match apply_overrides(&snapshot, execution_id, overrides, reason) {
            Ok(applied) => applied,
            Err(e) => return ResumeOutcome::Rejected(e.to_string()),
        };
        mark_resumed(&mut state);

        let blob = match state.to_snapshot() {
            Ok(blob) => blob,
            Err(e) => return ResumeOutcome::Failed(e.to_string()),
        };
        match self.store.complete_resume(execution_id, &blob, &adjustments).await {
            Ok(true) => {}
            Ok(false) => return ResumeOutcome::NotFound,
            Err(e) => return ResumeOutcome::Failed(e.to_string()),
        }

        self.record_history(
            execution_id,
            OperationType::Resume,
            Some(node),
            json!({ "kind": SuspensionKind::Interrupt, "overrides": overrides }),
            initiator,
        )
        .await;

        info!(execution_id = %execution_id, adjustments = adjustments.len(), "Interrupted execution resumed");
        ResumeOutcome::Resumed(Box::new(Resumed {
            kind: SuspensionKind::Interrupt,
            state,
            node,
            adjustments,
        }))
    }

    /// Cancel a suspension. Pauses are deleted; interrupt records are kept
    /// with status `cancelled`. Returns `false` when nothing matched.
    pub async fn cancel(&self, execution_id: &str, kind: SuspensionKind, initiator: &str) -> bool {
        let node = match kind {
            SuspensionKind::Pause => match self.pauses.remove(execution_id).await {
                Some(record) => Some(record.node),
                None => return false,
            },
            SuspensionKind::Interrupt => {
                match self
                    .store
                    .set_status(execution_id, InterruptStatus::Interrupted, InterruptStatus::Cancelled)
                    .await
                {
                    Ok(true) => None,
                    Ok(false) => return false,
                    Err(e) => {
                        warn!(execution_id = %execution_id, error = %e, "Failed to cancel interrupt");
                        return false;
                    }
                }
            }
        };

        info!(execution_id = %execution_id, kind = %kind, "Suspended execution cancelled");
        self.record_history(
            execution_id,
            OperationType::Cancel,
            node,
            json!({ "kind": kind }),
            initiator,
        )
        .await;
        true
    }

    /// Which suspension currently holds the execution.
    pub async fn locate(&self, execution_id: &str) -> AppResult<Option<SuspensionKind>> {
        if self.pauses.contains(execution_id).await {
            return Ok(Some(SuspensionKind::Pause));
        }
        let record = self.store.load_interrupt(execution_id).await?;
        Ok(record
            .filter(|r| r.status() == Some(InterruptStatus::Interrupted))
            .map(|_| SuspensionKind::Interrupt))
    }

    /// Append a history row. Failures are logged, not returned.
    pub async fn record_history(
        &self,
        execution_id: &str,
        operation: OperationType,
        node: Option<NodeName>,
        parameters: Value,
        initiator: &str,
    ) {
        let entry = HistoryEntry::new(execution_id, operation, node, parameters, initiator);
        let _ = self
            .store
            .append_history(&entry)
            .await
            .log(format!("recording {} history for {}", operation, execution_id));
    }

    /// Drop expired pauses and purge old cancelled interrupts.
    pub async fn cleanup(&self, policy: &RetentionPolicy) -> CleanupReport {
        let now = Utc::now();
        let expired_pauses = self.pauses.expire(policy.pause_max_age, now).await;

        let retention = chrono::Duration::from_std(policy.interrupt_retention)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let interrupts_purged = match self.store.purge_cancelled(now - retention).await {
            Ok(purged) => purged,
            Err(e) => {
                warn!(error = %e, "Failed to purge cancelled interrupts");
                0
            }
        };

        if !expired_pauses.is_empty() || interrupts_purged > 0 {
            info!(
                expired_pauses = expired_pauses.len(),
                interrupts_purged, "HITL cleanup removed records"
            );
        } else {
            debug!("HITL cleanup found nothing to remove");
        }

        CleanupReport {
            expired_pauses,
            interrupts_purged,
        }
    }

    pub async fn adjustments(&self, execution_id: &str) -> AppResult<Vec<ParameterAdjustment>> {
        self.store.list_adjustments(execution_id).await
    }

    pub async fn history(&self, execution_id: &str) -> AppResult<Vec<HistoryEntry>> {
        self.store.list_history(execution_id).await
    }

    pub async fn active_interrupts(&self) -> AppResult<Vec<InterruptRecord>> {
        self.store.list_interrupted().await
    }

    pub async fn pause_count(&self) -> usize {
        self.pauses.len().await
    }
}

fn mark_resumed(state: &mut WorkflowState) {
    if let Some(hitl) = state.hitl.as_mut() {
        hitl.status = HitlStatus::Resumed;
        hitl.timestamp = Utc::now();
    }
}

/// Apply overrides to a copy of `state`, one adjustment per changed field.
fn apply_overrides(
    state: &WorkflowState,
    execution_id: &str,
    overrides: Option<&BTreeMap<String, Value>>,
    reason: Option<&str>,
) -> Result<(WorkflowState, Vec<ParameterAdjustment>), StateError> {
    let mut state = state.clone();
    let mut adjustments = Vec::new();

    for (path, value) in overrides.into_iter().flatten() {
        let old = state.apply_override(path, value.clone())?;
        if old != *value {
            adjustments.push(ParameterAdjustment {
                interrupt_id: execution_id.to_string(),
                parameter_name: path.clone(),
                old_value: Some(old),
                new_value: Some(value.clone()),
                reason: reason.map(str::to_string),
                created_at: Utc::now(),
            });
        }
    }
    Ok((state, adjustments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::{OutputFormat, QueryOptions};
    use crate::hitl::MemoryInterruptStore;
    use std::time::Duration;

    fn manager() -> (Arc<MemoryInterruptStore>, HitlManager) {
        let store = Arc::new(MemoryInterruptStore::new());
        (store.clone(), HitlManager::new(store))
    }

    fn state() -> WorkflowState {
        WorkflowState::new("total sales by region", None, QueryOptions::default())
    }

    fn overrides(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn unwrap_resumed(outcome: ResumeOutcome) -> Resumed {
        match outcome {
            ResumeOutcome::Resumed(resumed) => *resumed,
            other => panic!("expected resumed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pause_resume_records_changed_fields_only() {
        let (_store, hitl) = manager();
        assert!(hitl.pause("e1", &state(), NodeName::ToolExecute, None, "user").await);

        let changes = overrides(&[
            ("options.output_format", json!("csv")),
            ("options.rerank_top_n", json!(5)),
        ]);
        let resumed = unwrap_resumed(hitl.resume("e1", Some(&changes), None, "user").await);

        assert_eq!(resumed.kind, SuspensionKind::Pause);
        assert_eq!(resumed.node, NodeName::ToolExecute);
        assert_eq!(resumed.state.options.output_format, OutputFormat::Csv);
        assert_eq!(resumed.adjustments.len(), 1);
        assert_eq!(resumed.adjustments[0].parameter_name, "options.output_format");
        assert_eq!(hitl.adjustments("e1").await.unwrap().len(), 1);

        assert_eq!(hitl.resume("e1", None, None, "user").await, ResumeOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_rejected_override_keeps_pause() {
        let (_store, hitl) = manager();
        hitl.pause("e1", &state(), NodeName::Route, None, "user").await;

        let changes = overrides(&[("hitl", json!(null))]);
        assert!(matches!(
            hitl.resume("e1", Some(&changes), None, "user").await,
            ResumeOutcome::Rejected(_)
        ));
        assert_eq!(hitl.locate("e1").await.unwrap(), Some(SuspensionKind::Pause));
    }

    #[tokio::test]
    async fn test_interrupt_resumes_once() {
        let (_store, hitl) = manager();
        assert!(hitl.interrupt("e1", &state(), NodeName::Synthesize, Some("review"), "user").await);
        assert_eq!(hitl.locate("e1").await.unwrap(), Some(SuspensionKind::Interrupt));

        let resumed = unwrap_resumed(hitl.resume("e1", None, None, "user").await);
        assert_eq!(resumed.kind, SuspensionKind::Interrupt);
        assert_eq!(resumed.state.query, "total sales by region");

        assert_eq!(hitl.resume("e1", None, None, "user").await, ResumeOutcome::NotFound);
        assert_eq!(hitl.locate("e1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_interrupt_fails_when_store_unavailable() {
        let (store, hitl) = manager();
        store.set_unavailable(true);
        assert!(!hitl.interrupt("e1", &state(), NodeName::Route, None, "user").await);
    }

    #[tokio::test]
    async fn test_cancel_interrupt_keeps_record_as_cancelled() {
        let (store, hitl) = manager();
        hitl.interrupt("e1", &state(), NodeName::Route, None, "user").await;

        assert!(hitl.cancel("e1", SuspensionKind::Interrupt, "user").await);
        assert!(!hitl.cancel("e1", SuspensionKind::Interrupt, "user").await);

        let record = store.load_interrupt("e1").await.unwrap().unwrap();
        assert_eq!(record.status(), Some(InterruptStatus::Cancelled));
        assert_eq!(hitl.resume("e1", None, None, "user").await, ResumeOutcome::NotFound);

        let operations: Vec<String> = hitl
            .history("e1")
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.operation_type)
            .collect();
        assert_eq!(operations, vec!["interrupt", "cancel"]);
    }

    #[tokio::test]
    async fn test_cancel_unknown_returns_false() {
        let (_store, hitl) = manager();
        assert!(!hitl.cancel("missing", SuspensionKind::Pause, "user").await);
        assert!(!hitl.cancel("missing", SuspensionKind::Interrupt, "user").await);
    }

    #[tokio::test]
    async fn test_cleanup_expires_pauses_and_purges_cancelled() {
        let (_store, hitl) = manager();
        hitl.pause("p1", &state(), NodeName::Route, None, "user").await;
        hitl.interrupt("i1", &state(), NodeName::Route, None, "user").await;
        hitl.cancel("i1", SuspensionKind::Interrupt, "user").await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = hitl
            .cleanup(&RetentionPolicy::uniform(Duration::from_millis(1)))
            .await;

        assert_eq!(report.expired_pauses, vec!["p1".to_string()]);
        assert_eq!(report.interrupts_purged, 1);
        assert_eq!(hitl.pause_count().await, 0);
    }
}

//! Durable interrupt store.
//!
//! [`PgInterruptStore`] is the production backend. [`MemoryInterruptStore`]
//! keeps the same rows in process memory for development and tests; sharing
//! one instance between two engines behaves like a restart against the same
//! database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::db::models::{HistoryEntry, InterruptRecord, InterruptStatus, NewInterrupt, ParameterAdjustment};
use crate::db::{queries, DbPool};
use crate::error::{AppError, AppResult};

/// Persistence for interrupt records and the HITL audit tables.
#[async_trait]
pub trait InterruptStore: Send + Sync {
    /// Insert or replace the interrupt record of an execution.
    async fn save_interrupt(&self, new: NewInterrupt) -> AppResult<()>;

    async fn load_interrupt(&self, execution_id: &str) -> AppResult<Option<InterruptRecord>>;

    /// Flip an `interrupted` record to `resumed`, storing the resumed state and
    /// its adjustments atomically. Returns `false` if no `interrupted` record exists.
    async fn complete_resume(
        &self,
        execution_id: &str,
        state_blob: &serde_json::Value,
        adjustments: &[ParameterAdjustment],
    ) -> AppResult<bool>;

    /// Conditional status transition.
    async fn set_status(&self, execution_id: &str, from: InterruptStatus, to: InterruptStatus) -> AppResult<bool>;

    async fn record_adjustments(&self, adjustments: &[ParameterAdjustment]) -> AppResult<()>;

    async fn list_adjustments(&self, interrupt_id: &str) -> AppResult<Vec<ParameterAdjustment>>;

    async fn append_history(&self, entry: &HistoryEntry) -> AppResult<()>;

    async fn list_history(&self, execution_id: &str) -> AppResult<Vec<HistoryEntry>>;

    /// Records still waiting to be resumed.
    async fn list_interrupted(&self) -> AppResult<Vec<InterruptRecord>>;

    /// Delete cancelled records last updated before `older_than`.
    async fn purge_cancelled(&self, older_than: DateTime<Utc>) -> AppResult<u64>;
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgInterruptStore {
    pool: DbPool,
}

impl PgInterruptStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InterruptStore for PgInterruptStore {
    async fn save_interrupt(&self, new: NewInterrupt) -> AppResult<()> {
        let id = queries::interrupt::upsert_interrupt(&self.pool, &new).await?;
        tracing::debug!(execution_id = %new.execution_id, id, "Interrupt record saved");
        Ok(())
    }

    async fn load_interrupt(&self, execution_id: &str) -> AppResult<Option<InterruptRecord>> {
        queries::interrupt::get_interrupt(&self.pool, execution_id).await
    }

    async fn complete_resume(
        &self,
        execution_id: &str,
        state_blob: &serde_json::Value,
        adjustments: &[ParameterAdjustment],
    ) -> AppResult<bool> {
        queries::interrupt::complete_resume(&self.pool, execution_id, state_blob, adjustments).await
    }

    async fn set_status(&self, execution_id: &str, from: InterruptStatus, to: InterruptStatus) -> AppResult<bool> {
        queries::interrupt::update_interrupt_status(&self.pool, execution_id, from, to).await
    }

    async fn record_adjustments(&self, adjustments: &[ParameterAdjustment]) -> AppResult<()> {
        queries::adjustment::insert_adjustments(&self.pool, adjustments).await
    }

    async fn list_adjustments(&self, interrupt_id: &str) -> AppResult<Vec<ParameterAdjustment>> {
        queries::adjustment::list_adjustments(&self.pool, interrupt_id).await
    }

    async fn append_history(&self, entry: &HistoryEntry) -> AppResult<()> {
        queries::history::insert_history(&self.pool, entry).await
    }

    async fn list_history(&self, execution_id: &str) -> AppResult<Vec<HistoryEntry>> {
        queries::history::list_history(&self.pool, execution_id).await
    }

    async fn list_interrupted(&self) -> AppResult<Vec<InterruptRecord>> {
        queries::interrupt::list_interrupted(&self.pool).await
    }

    async fn purge_cancelled(&self, older_than: DateTime<Utc>) -> AppResult<u64> {
        queries::interrupt::delete_cancelled_before(&self.pool, older_than).await
    }
}

#[derive(Default)]
struct MemoryTables {
    interrupts: HashMap<String, InterruptRecord>,
    adjustments: Vec<ParameterAdjustment>,
    history: Vec<HistoryEntry>,
}

/// In-process store with the same semantics as [`PgInterruptStore`].
#[derive(Default)]
pub struct MemoryInterruptStore {
    tables: Mutex<MemoryTables>,
    next_id: AtomicI64,
    unavailable: AtomicBool,
}

impl MemoryInterruptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with a store error until reset,
    /// as a database outage would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Store("interrupt store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl InterruptStore for MemoryInterruptStore {
    async fn save_interrupt(&self, new: NewInterrupt) -> AppResult<()> {
        self.check_available()?;
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        let (id, created_at) = tables
            .interrupts
            .get(&new.execution_id)
            .map(|r| (r.id, r.created_at))
            .unwrap_or_else(|| (self.next_id.fetch_add(1, Ordering::Relaxed) + 1, now));
        tables.interrupts.insert(
            new.execution_id.clone(),
            InterruptRecord {
                id,
                execution_id: new.execution_id,
                user_input: new.user_input,
                datasource_ref: new.datasource_ref,
                interrupt_node: new.interrupt_node.to_string(),
                interrupt_reason: new.interrupt_reason,
                state_blob: new.state_blob,
                status: InterruptStatus::Interrupted.to_string(),
                created_at,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn load_interrupt(&self, execution_id: &str) -> AppResult<Option<InterruptRecord>> {
        self.check_available()?;
        Ok(self.tables.lock().await.interrupts.get(execution_id).cloned())
    }

    async fn complete_resume(
        &self,
        execution_id: &str,
        state_blob: &serde_json::Value,
        adjustments: &[ParameterAdjustment],
    ) -> AppResult<bool> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        match tables.interrupts.get_mut(execution_id) {
            Some(record) if record.status() == Some(InterruptStatus::Interrupted) => {
                record.status = InterruptStatus::Resumed.to_string();
                record.state_blob = state_blob.clone();
                record.updated_at = Utc::now();
            }
            _ => return Ok(false),
        }
        tables.adjustments.extend_from_slice(adjustments);
        Ok(true)
    }

    async fn set_status(&self, execution_id: &str, from: InterruptStatus, to: InterruptStatus) -> AppResult<bool> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        match tables.interrupts.get_mut(execution_id) {
            Some(record) if record.status() == Some(from) => {
                record.status = to.to_string();
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_adjustments(&self, adjustments: &[ParameterAdjustment]) -> AppResult<()> {
        self.check_available()?;
        self.tables
            .lock()
            .await
            .adjustments
            .extend_from_slice(adjustments);
        Ok(())
    }

    async fn list_adjustments(&self, interrupt_id: &str) -> AppResult<Vec<ParameterAdjustment>> {
        self.check_available()?;
        Ok(self
            .tables
            .lock()
            .await
            .adjustments
            .iter()
            .filter(|a| a.interrupt_id == interrupt_id)
            .cloned()
            .collect())
    }

    async fn append_history(&self, entry: &HistoryEntry) -> AppResult<()> {
        self.check_available()?;
        self.tables.lock().await.history.push(entry.clone());
        Ok(())
    }

    async fn list_history(&self, execution_id: &str) -> AppResult<Vec<HistoryEntry>> {
        self.check_available()?;
        Ok(self
            .tables
            .lock()
            .await
            .history
            .iter()
            .filter(|h| h.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn list_interrupted(&self) -> AppResult<Vec<InterruptRecord>> {
        self.check_available()?;
        let mut records: Vec<InterruptRecord> = self
            .tables
            .lock()
            .await
            .interrupts
            .values()
            .filter(|r| r.status() == Some(InterruptStatus::Interrupted))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn purge_cancelled(&self, older_than: DateTime<Utc>) -> AppResult<u64> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        let before = tables.interrupts.len();
        tables
            .interrupts
            .retain(|_, r| !(r.status() == Some(InterruptStatus::Cancelled) && r.updated_at < older_than));
        Ok((before - tables.interrupts.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::NodeName;
    use serde_json::json;

    fn new_interrupt(id: &str) -> NewInterrupt {
        NewInterrupt {
            execution_id: id.to_string(),
            user_input: "total sales by region".to_string(),
            datasource_ref: Some("warehouse".to_string()),
            interrupt_node: NodeName::ToolExecute,
            interrupt_reason: Some("review".to_string()),
            state_blob: json!({"version": 1, "query": "total sales by region"}),
        }
    }

    fn adjustment(id: &str) -> ParameterAdjustment {
        ParameterAdjustment {
            interrupt_id: id.to_string(),
            parameter_name: "options.output_format".to_string(),
            old_value: Some(json!("table")),
            new_value: Some(json!("csv")),
            reason: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_complete_resume_only_once() {
        let store = MemoryInterruptStore::new();
        store.save_interrupt(new_interrupt("e1")).await.unwrap();

        let blob = json!({"version": 1});
        assert!(store.complete_resume("e1", &blob, &[adjustment("e1")]).await.unwrap());
        assert!(!store.complete_resume("e1", &blob, &[adjustment("e1")]).await.unwrap());

        let record = store.load_interrupt("e1").await.unwrap().unwrap();
        assert_eq!(record.status(), Some(InterruptStatus::Resumed));
        assert_eq!(store.list_adjustments("e1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resave_keeps_id_and_resets_status() {
        let store = MemoryInterruptStore::new();
        store.save_interrupt(new_interrupt("e1")).await.unwrap();
        let first = store.load_interrupt("e1").await.unwrap().unwrap();
        store
            .set_status("e1", InterruptStatus::Interrupted, InterruptStatus::Resumed)
            .await
            .unwrap();

        store.save_interrupt(new_interrupt("e1")).await.unwrap();
        let second = store.load_interrupt("e1").await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.status(), Some(InterruptStatus::Interrupted));
    }

    #[tokio::test]
    async fn test_purge_only_removes_old_cancelled() {
        let store = MemoryInterruptStore::new();
        store.save_interrupt(new_interrupt("cancelled")).await.unwrap();
        store.save_interrupt(new_interrupt("waiting")).await.unwrap();
        store
            .set_status("cancelled", InterruptStatus::Interrupted, InterruptStatus::Cancelled)
            .await
            .unwrap();

        let purged = store
            .purge_cancelled(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.load_interrupt("cancelled").await.unwrap().is_none());
        assert_eq!(store.list_interrupted().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = MemoryInterruptStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.save_interrupt(new_interrupt("e1")).await,
            Err(AppError::Store(_))
        ));
        store.set_unavailable(false);
        assert!(store.save_interrupt(new_interrupt("e1")).await.is_ok());
    }
}

//! Interrupt record queries.

use chrono::{DateTime, Utc};

use crate::db::models::{InterruptRecord, InterruptStatus, NewInterrupt, ParameterAdjustment};
use crate::db::DbPool;
use crate::error::AppResult;

const INTERRUPT_COLUMNS: &str = "id, execution_id, user_input, datasource_ref, interrupt_node, \
     interrupt_reason, state_blob, status, created_at, updated_at";

/// Insert an interrupt record, replacing the record of a previous
/// suspension of the same execution.
pub async fn upsert_interrupt(pool: &DbPool, new: &NewInterrupt) -> AppResult<i64> {
    let result: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO querygraph.interrupts
            (execution_id, user_input, datasource_ref, interrupt_node, interrupt_reason, state_blob, status)
        VALUES ($1, $2, $3, $4, $5, $6, 'interrupted')
        ON CONFLICT (execution_id) DO UPDATE SET
            user_input = EXCLUDED.user_input,
            datasource_ref = EXCLUDED.datasource_ref,
            interrupt_node = EXCLUDED.interrupt_node,
            interrupt_reason = EXCLUDED.interrupt_reason,
            state_blob = EXCLUDED.state_blob,
            status = 'interrupted',
            updated_at = NOW()
        RETURNING id
        "#,
    )
    .bind(&new.execution_id)
    .bind(&new.user_input)
    .bind(&new.datasource_ref)
    .bind(new.interrupt_node.as_str())
    .bind(&new.interrupt_reason)
    .bind(&new.state_blob)
    .fetch_one(pool)
    .await?;

    Ok(result.0)
}

/// Get the interrupt record of an execution.
pub async fn get_interrupt(pool: &DbPool, execution_id: &str) -> AppResult<Option<InterruptRecord>> {
    let record = sqlx::query_as::<_, InterruptRecord>(&format!(
        "SELECT {} FROM querygraph.interrupts WHERE execution_id = $1",
        INTERRUPT_COLUMNS
    ))
    .bind(execution_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Move a record from one status to another. Returns `false` if the record
/// is missing or not in `from`.
pub async fn update_interrupt_status(
    pool: &DbPool,
    execution_id: &str,
    from: InterruptStatus,
    to: InterruptStatus,
) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE querygraph.interrupts
        SET status = $3, updated_at = NOW()
        WHERE execution_id = $1 AND status = $2
        "#,
    )
    .bind(execution_id)
    .bind(from.as_str())
    .bind(to.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Mark an interrupt resumed and record its adjustments in one transaction.
///
/// Returns `false` (and writes nothing) if the record is not `interrupted`.
pub async fn complete_resume(
    pool: &DbPool,
    execution_id: &str,
    state_blob: &serde_json::Value,
    adjustments: &[ParameterAdjustment],
) -> AppResult<bool> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        r#"
        UPDATE querygraph.interrupts
        SET status = 'resumed', state_blob = $2, updated_at = NOW()
        WHERE execution_id = $1 AND status = 'interrupted'
        "#,
    )
    .bind(execution_id)
    .bind(state_blob)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() != 1 {
        tx.rollback().await?;
        return Ok(false);
    }

    for adjustment in adjustments {
        sqlx::query(
            r#"
            INSERT INTO querygraph.parameter_adjustments
                (interrupt_id, parameter_name, old_value, new_value, reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&adjustment.interrupt_id)
        .bind(&adjustment.parameter_name)
        .bind(&adjustment.old_value)
        .bind(&adjustment.new_value)
        .bind(&adjustment.reason)
        .bind(adjustment.created_at)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(true)
}

/// List records still waiting in `interrupted`, oldest first.
pub async fn list_interrupted(pool: &DbPool) -> AppResult<Vec<InterruptRecord>> {
    let records = sqlx::query_as::<_, InterruptRecord>(&format!(
        "SELECT {} FROM querygraph.interrupts WHERE status = 'interrupted' ORDER BY created_at",
        INTERRUPT_COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Delete cancelled records last updated before `older_than`.
pub async fn delete_cancelled_before(pool: &DbPool, older_than: DateTime<Utc>) -> AppResult<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM querygraph.interrupts
        WHERE status = 'cancelled' AND updated_at < $1
        "#,
    )
    .bind(older_than)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

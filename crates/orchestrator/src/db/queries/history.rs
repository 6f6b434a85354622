//! Execution history queries.

use crate::db::models::HistoryEntry;
use crate::db::DbPool;
use crate::error::AppResult;

/// Append one history row.
pub async fn insert_history(pool: &DbPool, entry: &HistoryEntry) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO querygraph.execution_history
            (execution_id, operation_type, node_name, parameters_blob, "timestamp", initiator)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(&entry.execution_id)
    .bind(&entry.operation_type)
    .bind(&entry.node_name)
    .bind(&entry.parameters_blob)
    .bind(entry.timestamp)
    .bind(&entry.initiator)
    .execute(pool)
    .await?;

    Ok(())
}

/// List the history of an execution in recording order.
pub async fn list_history(pool: &DbPool, execution_id: &str) -> AppResult<Vec<HistoryEntry>> {
    let rows = sqlx::query_as::<_, HistoryEntry>(
        r#"
        SELECT execution_id, operation_type, node_name, parameters_blob, "timestamp", initiator
        FROM querygraph.execution_history
        WHERE execution_id = $1
        ORDER BY id
        "#,
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

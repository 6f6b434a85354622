//! Parameter adjustment queries.

use crate::db::models::ParameterAdjustment;
use crate::db::DbPool;
use crate::error::AppResult;

/// Append adjustments outside of a resume transaction (pause resumes).
pub async fn insert_adjustments(pool: &DbPool, adjustments: &[ParameterAdjustment]) -> AppResult<()> {
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
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// List the adjustments recorded for an interrupt id, oldest first.
pub async fn list_adjustments(pool: &DbPool, interrupt_id: &str) -> AppResult<Vec<ParameterAdjustment>> {
    let rows = sqlx::query_as::<_, ParameterAdjustment>(
        r#"
        SELECT interrupt_id, parameter_name, old_value, new_value, reason, created_at
        FROM querygraph.parameter_adjustments
        WHERE interrupt_id = $1
        ORDER BY id
        "#,
    )
    .bind(interrupt_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

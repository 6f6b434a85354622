//! Idempotent schema bootstrap for the `querygraph` schema.

use crate::db::DbPool;
use crate::error::AppResult;

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS querygraph",
    r#"
    CREATE TABLE IF NOT EXISTS querygraph.interrupts (
        id BIGSERIAL PRIMARY KEY,
        execution_id TEXT NOT NULL UNIQUE,
        user_input TEXT NOT NULL,
        datasource_ref TEXT,
        interrupt_node TEXT NOT NULL,
        interrupt_reason TEXT,
        state_blob JSONB NOT NULL,
        status TEXT NOT NULL DEFAULT 'interrupted',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_interrupts_status ON querygraph.interrupts (status, updated_at)",
    r#"
    CREATE TABLE IF NOT EXISTS querygraph.parameter_adjustments (
        id BIGSERIAL PRIMARY KEY,
        interrupt_id TEXT NOT NULL,
        parameter_name TEXT NOT NULL,
        old_value JSONB,
        new_value JSONB,
        reason TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_adjustments_interrupt ON querygraph.parameter_adjustments (interrupt_id)",
    r#"
    CREATE TABLE IF NOT EXISTS querygraph.execution_history (
        id BIGSERIAL PRIMARY KEY,
        execution_id TEXT NOT NULL,
        operation_type TEXT NOT NULL,
        node_name TEXT,
        parameters_blob JSONB NOT NULL DEFAULT '{}'::jsonb,
        "timestamp" TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        initiator TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_history_execution ON querygraph.execution_history (execution_id)",
];

/// Create the schema and tables if they do not exist.
pub async fn init_schema(pool: &DbPool) -> AppResult<()> {
    for statement in SCHEMA_STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!(tables = 3, "Interrupt store schema ready");
    Ok(())
}

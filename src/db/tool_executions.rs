use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "tool_execution_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ToolExecutionStatus {
    Requested,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ToolExecutionRow {
    pub execution_id: Uuid,
    pub tenant_id: String,
    pub exception_id: Uuid,
    pub step_order: Option<i32>,
    pub tool_id: String,
    pub idempotency_key: String,
    pub attempt: i32,
    pub requested_by_actor_type: String,
    pub requested_by_actor_id: Option<String>,
    pub input_payload: Value,
    pub output_payload: Option<Value>,
    pub status: ToolExecutionStatus,
    pub error_message: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Declared idempotency key for a tool invocation. Duplicate deliveries of
/// the same request collapse onto one execution row per attempt.
pub fn idempotency_key(exception_id: Uuid, step_order: Option<i32>, tool_id: &str) -> String {
    format!(
        "{exception_id}:{}:{tool_id}",
        step_order.map_or_else(|| "adhoc".to_string(), |order| order.to_string())
    )
}

pub struct NewToolExecution<'a> {
    pub execution_id: Uuid,
    pub tenant_id: &'a str,
    pub exception_id: Uuid,
    pub step_order: Option<i32>,
    pub tool_id: &'a str,
    pub attempt: i32,
    pub requested_by_actor_type: &'a str,
    pub requested_by_actor_id: Option<&'a str>,
    pub input_payload: &'a Value,
}

/// Latest execution attempt for an idempotency key. The tool worker uses it
/// to distinguish a replay of a finished invocation from a genuine retry.
pub async fn latest_for_key(
    pool: &PgPool,
    key: &str,
) -> Result<Option<ToolExecutionRow>, sqlx::Error> {
    sqlx::query_as::<_, ToolExecutionRow>(
        r#"
        SELECT
            execution_id, tenant_id, exception_id, step_order, tool_id,
            idempotency_key, attempt, requested_by_actor_type,
            requested_by_actor_id, input_payload, output_payload, status,
            error_message, requested_at, started_at, completed_at
        FROM tool_executions
        WHERE idempotency_key = $1
        ORDER BY attempt DESC
        LIMIT 1
        "#,
    )
    .bind(key)
    .fetch_optional(pool)
    .await
}

/// Records one execution attempt on start. Partition ordering guarantees a
/// single writer per key; the unique index absorbs a duplicate delivery that
/// slips through anyway.
pub async fn insert_attempt(
    pool: &PgPool,
    input: NewToolExecution<'_>,
) -> Result<ToolExecutionRow, sqlx::Error> {
    let key = idempotency_key(input.exception_id, input.step_order, input.tool_id);
    let inserted = sqlx::query_as::<_, ToolExecutionRow>(
        r#"
        INSERT INTO tool_executions (
            execution_id,
            tenant_id,
            exception_id,
            step_order,
            tool_id,
            idempotency_key,
            attempt,
            requested_by_actor_type,
            requested_by_actor_id,
            input_payload,
            status
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'requested')
        ON CONFLICT (idempotency_key, attempt) DO NOTHING
        RETURNING
            execution_id, tenant_id, exception_id, step_order, tool_id,
            idempotency_key, attempt, requested_by_actor_type,
            requested_by_actor_id, input_payload, output_payload, status,
            error_message, requested_at, started_at, completed_at
        "#,
    )
    .bind(input.execution_id)
    .bind(input.tenant_id)
    .bind(input.exception_id)
    .bind(input.step_order)
    .bind(input.tool_id)
    .bind(&key)
    .bind(input.attempt)
    .bind(input.requested_by_actor_type)
    .bind(input.requested_by_actor_id)
    .bind(input.input_payload)
    .fetch_optional(pool)
    .await?;

    if let Some(row) = inserted {
        return Ok(row);
    }

    sqlx::query_as::<_, ToolExecutionRow>(
        r#"
        SELECT
            execution_id, tenant_id, exception_id, step_order, tool_id,
            idempotency_key, attempt, requested_by_actor_type,
            requested_by_actor_id, input_payload, output_payload, status,
            error_message, requested_at, started_at, completed_at
        FROM tool_executions
        WHERE idempotency_key = $1 AND attempt = $2
        "#,
    )
    .bind(&key)
    .bind(input.attempt)
    .fetch_one(pool)
    .await
}

pub async fn mark_running<'c, E>(executor: E, execution_id: Uuid) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE tool_executions
        SET status = 'running', started_at = COALESCE(started_at, NOW())
        WHERE execution_id = $1 AND status = 'requested'
        "#,
    )
    .bind(execution_id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Terminal status is write-once: completion lands only while the row is
/// still requested/running.
pub async fn complete<'c, E>(
    executor: E,
    execution_id: Uuid,
    success: bool,
    output_payload: Option<&Value>,
    error_message: Option<&str>,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let status = if success {
        ToolExecutionStatus::Succeeded
    } else {
        ToolExecutionStatus::Failed
    };
    let result = sqlx::query(
        r#"
        UPDATE tool_executions
        SET status = $2,
            output_payload = $3,
            error_message = $4,
            completed_at = NOW()
        WHERE execution_id = $1 AND status IN ('requested', 'running')
        "#,
    )
    .bind(execution_id)
    .bind(status)
    .bind(output_payload)
    .bind(error_message)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn list_for_exception(
    pool: &PgPool,
    tenant_id: &str,
    exception_id: Uuid,
) -> Result<Vec<ToolExecutionRow>, sqlx::Error> {
    sqlx::query_as::<_, ToolExecutionRow>(
        r#"
        SELECT
            execution_id, tenant_id, exception_id, step_order, tool_id,
            idempotency_key, attempt, requested_by_actor_type,
            requested_by_actor_id, input_payload, output_payload, status,
            error_message, requested_at, started_at, completed_at
        FROM tool_executions
        WHERE tenant_id = $1 AND exception_id = $2
        ORDER BY requested_at
        "#,
    )
    .bind(tenant_id)
    .bind(exception_id)
    .fetch_all(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_stable_per_step_and_tool() {
        let exception = Uuid::new_v4();
        let a = idempotency_key(exception, Some(2), "ssi-verify");
        let b = idempotency_key(exception, Some(2), "ssi-verify");
        let c = idempotency_key(exception, Some(3), "ssi-verify");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(idempotency_key(exception, None, "notify").contains("adhoc"));
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

/// Timeline row types. The full audit history of an exception is the ordered
/// sequence of these rows; they are never updated or deleted.
pub mod timeline {
    pub const EXCEPTION_CREATED: &str = "ExceptionCreated";
    pub const EXCEPTION_NORMALIZED: &str = "ExceptionNormalized";
    pub const TRIAGE_COMPLETED: &str = "TriageCompleted";
    pub const POLICY_COMPLETED: &str = "PolicyCompleted";
    pub const POLICY_REOPENED: &str = "PolicyReopened";
    pub const SEVERITY_OVERRIDDEN: &str = "SeverityOverridden";
    pub const EXCEPTION_ESCALATED: &str = "ExceptionEscalated";
    pub const EXCEPTION_CLOSED: &str = "ExceptionClosed";
    pub const PLAYBOOK_MATCHED: &str = "PlaybookMatched";
    pub const PLAYBOOK_COMPLETED: &str = "PlaybookCompleted";
    pub const STEP_REQUESTED: &str = "StepRequested";
    pub const STEP_COMPLETED: &str = "StepCompleted";
    pub const STEP_SKIPPED: &str = "StepSkipped";
    pub const TOOL_REQUESTED: &str = "ToolRequested";
    pub const TOOL_COMPLETED: &str = "ToolCompleted";
    pub const FEEDBACK_CAPTURED: &str = "FeedbackCaptured";
    pub const SLA_IMMINENT: &str = "SlaImminent";
    pub const SLA_EXPIRED: &str = "SlaExpired";
    pub const PROCESSING_ERROR: &str = "ProcessingError";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Agent,
    User,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::Agent => "agent",
            ActorType::User => "user",
            ActorType::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ExceptionEventRow {
    pub event_id: Uuid,
    pub tenant_id: String,
    pub exception_id: Uuid,
    pub event_type: String,
    pub actor_type: String,
    pub actor_id: Option<String>,
    pub producer: String,
    pub attempt: i32,
    pub dedupe_key: String,
    pub payload: Value,
    pub schema_version: i32,
    pub seq: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewExceptionEvent {
    pub event_id: Uuid,
    pub event_type: &'static str,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub producer: String,
    pub attempt: i32,
    pub dedupe_key: String,
    pub payload: Value,
}

impl NewExceptionEvent {
    /// Timeline row produced by a worker on behalf of the platform itself.
    pub fn system(event_type: &'static str, producer: &str, attempt: i32, payload: Value) -> Self {
        let dedupe_key = format!("{event_type}:{producer}:{attempt}");
        NewExceptionEvent {
            event_id: Uuid::new_v4(),
            event_type,
            actor_type: ActorType::System,
            actor_id: None,
            producer: producer.to_string(),
            attempt,
            dedupe_key,
            payload,
        }
    }

    /// Row type that legitimately repeats over the exception's lifetime
    /// (per-step rows, per-trigger policy runs, per-message errors). The
    /// scope widens the logical key so a replay of one occurrence dedupes
    /// without masking the next.
    pub fn scoped(
        event_type: &'static str,
        producer: &str,
        attempt: i32,
        scope: &str,
        payload: Value,
    ) -> Self {
        let mut event = Self::system(event_type, producer, attempt, payload);
        event.dedupe_key = format!("{event_type}:{scope}:{producer}:{attempt}");
        event
    }

    /// Step-scoped rows repeat per step; the logical key carries the order so
    /// replays of one step dedupe without masking the next.
    pub fn step_scoped(
        event_type: &'static str,
        producer: &str,
        attempt: i32,
        step_order: i32,
        payload: Value,
    ) -> Self {
        Self::scoped(event_type, producer, attempt, &step_order.to_string(), payload)
    }

    pub fn with_actor(mut self, actor_type: ActorType, actor_id: Option<String>) -> Self {
        self.actor_type = actor_type;
        self.actor_id = actor_id;
        self
    }
}

/// Appends one timeline row. Duplicate logical keys (replay) and duplicate
/// `event_id`s are silently absorbed; returns whether a row landed.
pub async fn insert<'c, E>(
    executor: E,
    tenant_id: &str,
    exception_id: Uuid,
    event: &NewExceptionEvent,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO exception_events (
            event_id,
            tenant_id,
            exception_id,
            event_type,
            actor_type,
            actor_id,
            producer,
            attempt,
            dedupe_key,
            payload,
            schema_version
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 1)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(event.event_id)
    .bind(tenant_id)
    .bind(exception_id)
    .bind(event.event_type)
    .bind(event.actor_type.as_str())
    .bind(&event.actor_id)
    .bind(&event.producer)
    .bind(event.attempt)
    .bind(&event.dedupe_key)
    .bind(&event.payload)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Full timeline in delivery order: `created_at` with the insertion sequence
/// breaking ties.
pub async fn list(
    pool: &PgPool,
    tenant_id: &str,
    exception_id: Uuid,
) -> Result<Vec<ExceptionEventRow>, sqlx::Error> {
    sqlx::query_as::<_, ExceptionEventRow>(
        r#"
        SELECT
            event_id,
            tenant_id,
            exception_id,
            event_type,
            actor_type,
            actor_id,
            producer,
            attempt,
            dedupe_key,
            payload,
            schema_version,
            seq,
            created_at
        FROM exception_events
        WHERE tenant_id = $1 AND exception_id = $2
        ORDER BY created_at, seq
        "#,
    )
    .bind(tenant_id)
    .bind(exception_id)
    .fetch_all(pool)
    .await
}

pub async fn count_by_type(
    pool: &PgPool,
    tenant_id: &str,
    exception_id: Uuid,
    event_type: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(*)
        FROM exception_events
        WHERE tenant_id = $1 AND exception_id = $2 AND event_type = $3
        "#,
    )
    .bind(tenant_id)
    .bind(exception_id)
    .bind(event_type)
    .fetch_one(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn logical_key_distinguishes_steps_but_not_replays() {
        let first = NewExceptionEvent::step_scoped(timeline::STEP_REQUESTED, "playbook", 1, 1, json!({}));
        let second = NewExceptionEvent::step_scoped(timeline::STEP_REQUESTED, "playbook", 1, 2, json!({}));
        let replay = NewExceptionEvent::step_scoped(timeline::STEP_REQUESTED, "playbook", 1, 1, json!({}));
        assert_ne!(first.dedupe_key, second.dedupe_key);
        assert_eq!(first.dedupe_key, replay.dedupe_key);
    }

    #[test]
    fn retried_attempts_emit_distinct_rows() {
        let first = NewExceptionEvent::system(timeline::PROCESSING_ERROR, "tool", 1, json!({}));
        let second = NewExceptionEvent::system(timeline::PROCESSING_ERROR, "tool", 2, json!({}));
        assert_ne!(first.dedupe_key, second.dedupe_key);
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "step_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Skipped | StepStatus::Failed
        )
    }

    /// Counts as "done" for step-progression purposes: the next step may
    /// leave pending only once this one is completed or skipped.
    pub fn unblocks_next(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PlaybookProgressRow {
    pub tenant_id: String,
    pub exception_id: Uuid,
    pub playbook_id: String,
    pub playbook_version: i32,
    pub step_order: i32,
    pub step_name: String,
    pub action_type: String,
    pub status: StepStatus,
    pub attempts: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

pub struct NewProgressStep<'a> {
    pub playbook_id: &'a str,
    pub playbook_version: i32,
    pub step_order: i32,
    pub step_name: &'a str,
    pub action_type: &'a str,
}

/// Seeds the per-step rows when a playbook is matched. Replays are absorbed
/// by the primary key.
pub async fn insert_steps(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    tenant_id: &str,
    exception_id: Uuid,
    steps: &[NewProgressStep<'_>],
) -> Result<(), sqlx::Error> {
    for step in steps {
        sqlx::query(
            r#"
            INSERT INTO playbook_progress (
                tenant_id,
                exception_id,
                playbook_id,
                playbook_version,
                step_order,
                step_name,
                action_type,
                status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
            ON CONFLICT (tenant_id, exception_id, step_order) DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(exception_id)
        .bind(step.playbook_id)
        .bind(step.playbook_version)
        .bind(step.step_order)
        .bind(step.step_name)
        .bind(step.action_type)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub async fn list(
    pool: &PgPool,
    tenant_id: &str,
    exception_id: Uuid,
) -> Result<Vec<PlaybookProgressRow>, sqlx::Error> {
    sqlx::query_as::<_, PlaybookProgressRow>(
        r#"
        SELECT
            tenant_id,
            exception_id,
            playbook_id,
            playbook_version,
            step_order,
            step_name,
            action_type,
            status,
            attempts,
            started_at,
            completed_at,
            notes
        FROM playbook_progress
        WHERE tenant_id = $1 AND exception_id = $2
        ORDER BY step_order
        "#,
    )
    .bind(tenant_id)
    .bind(exception_id)
    .fetch_all(pool)
    .await
}

pub async fn get_step<'c, E>(
    executor: E,
    tenant_id: &str,
    exception_id: Uuid,
    step_order: i32,
) -> Result<Option<PlaybookProgressRow>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, PlaybookProgressRow>(
        r#"
        SELECT
            tenant_id,
            exception_id,
            playbook_id,
            playbook_version,
            step_order,
            step_name,
            action_type,
            status,
            attempts,
            started_at,
            completed_at,
            notes
        FROM playbook_progress
        WHERE tenant_id = $1 AND exception_id = $2 AND step_order = $3
        "#,
    )
    .bind(tenant_id)
    .bind(exception_id)
    .bind(step_order)
    .fetch_optional(executor)
    .await
}

pub async fn mark_in_progress<'c, E>(
    executor: E,
    tenant_id: &str,
    exception_id: Uuid,
    step_order: i32,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE playbook_progress
        SET status = 'in_progress',
            attempts = attempts + 1,
            started_at = COALESCE(started_at, NOW())
        WHERE tenant_id = $1 AND exception_id = $2 AND step_order = $3
          AND status IN ('pending', 'in_progress')
        "#,
    )
    .bind(tenant_id)
    .bind(exception_id)
    .bind(step_order)
    .execute(executor)
    .await?;
    Ok(())
}

/// Moves a step to a terminal status. No-op when the step already reached
/// one, so replayed completions cannot rewrite history.
pub async fn mark_terminal<'c, E>(
    executor: E,
    tenant_id: &str,
    exception_id: Uuid,
    step_order: i32,
    status: StepStatus,
    notes: Option<&str>,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE playbook_progress
        SET status = $4,
            completed_at = NOW(),
            notes = COALESCE($5, notes)
        WHERE tenant_id = $1 AND exception_id = $2 AND step_order = $3
          AND status IN ('pending', 'in_progress')
        "#,
    )
    .bind(tenant_id)
    .bind(exception_id)
    .bind(step_order)
    .bind(status)
    .bind(notes)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

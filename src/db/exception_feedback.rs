use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FeedbackRow {
    pub id: i64,
    pub tenant_id: String,
    pub exception_id: Uuid,
    pub verdict: String,
    pub rationale: Option<String>,
    pub actor_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub async fn insert<'c, E>(
    executor: E,
    tenant_id: &str,
    exception_id: Uuid,
    verdict: &str,
    rationale: Option<&str>,
    actor_id: Option<&str>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO exception_feedback (tenant_id, exception_id, verdict, rationale, actor_id)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(tenant_id)
    .bind(exception_id)
    .bind(verdict)
    .bind(rationale)
    .bind(actor_id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn list(
    pool: &PgPool,
    tenant_id: &str,
    exception_id: Uuid,
) -> Result<Vec<FeedbackRow>, sqlx::Error> {
    sqlx::query_as::<_, FeedbackRow>(
        r#"
        SELECT id, tenant_id, exception_id, verdict, rationale, actor_id, created_at
        FROM exception_feedback
        WHERE tenant_id = $1 AND exception_id = $2
        ORDER BY created_at
        "#,
    )
    .bind(tenant_id)
    .bind(exception_id)
    .fetch_all(pool)
    .await
}

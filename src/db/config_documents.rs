use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres};

pub const KIND_DOMAIN_PACK: &str = "domain_pack";
pub const KIND_POLICY_PACK: &str = "policy_pack";
pub const KIND_PLAYBOOK_CATALOG: &str = "playbook_catalog";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ConfigDocumentRow {
    pub tenant_id: String,
    pub domain: String,
    pub kind: String,
    pub version: i32,
    pub document: Value,
    pub published_at: DateTime<Utc>,
}

/// Publishes a new immutable version of a pack document. Versions are
/// caller-assigned and never overwritten.
pub async fn publish<'c, E>(
    executor: E,
    tenant_id: &str,
    domain: &str,
    kind: &str,
    version: i32,
    document: &Value,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO config_documents (tenant_id, domain, kind, version, document)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(tenant_id)
    .bind(domain)
    .bind(kind)
    .bind(version)
    .bind(document)
    .execute(executor)
    .await?;
    Ok(())
}

/// Latest version of every kind for `(tenant, domain)`, the raw material of
/// a config snapshot.
pub async fn latest(
    pool: &PgPool,
    tenant_id: &str,
    domain: &str,
) -> Result<Vec<ConfigDocumentRow>, sqlx::Error> {
    sqlx::query_as::<_, ConfigDocumentRow>(
        r#"
        SELECT DISTINCT ON (kind)
            tenant_id, domain, kind, version, document, published_at
        FROM config_documents
        WHERE tenant_id = $1 AND domain = $2
        ORDER BY kind, version DESC
        "#,
    )
    .bind(tenant_id)
    .bind(domain)
    .fetch_all(pool)
    .await
}

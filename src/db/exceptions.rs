use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "exception_severity", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "LOW" => Some(Severity::Low),
            "MEDIUM" => Some(Severity::Medium),
            "HIGH" => Some(Severity::High),
            "CRITICAL" => Some(Severity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "exception_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExceptionStatus {
    Open,
    InProgress,
    PendingApproval,
    Resolved,
    Escalated,
    Closed,
}

impl ExceptionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExceptionStatus::Resolved | ExceptionStatus::Closed)
    }

    /// Legal transitions of the status state machine. Anything not listed
    /// here is forbidden and must never reach the store.
    pub fn can_transition_to(&self, next: ExceptionStatus) -> bool {
        use ExceptionStatus::*;
        matches!(
            (self, next),
            (Open, InProgress)
                | (Open, PendingApproval)
                | (Open, Escalated)
                | (Open, Closed)
                | (PendingApproval, InProgress)
                | (PendingApproval, Escalated)
                | (PendingApproval, Closed)
                | (InProgress, Resolved)
                | (InProgress, Escalated)
                | (Resolved, Closed)
                | (Escalated, Open)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "pipeline_stage", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Intake,
    Triage,
    Policy,
    Playbook,
    Step,
    Feedback,
    Terminal,
}

impl PipelineStage {
    /// Position along the declared pipeline, used for the monotone-stage
    /// guard. Replayed events for an earlier stage are stale.
    pub fn rank(&self) -> u8 {
        match self {
            PipelineStage::Intake => 0,
            PipelineStage::Triage => 1,
            PipelineStage::Policy => 2,
            PipelineStage::Playbook => 3,
            PipelineStage::Step => 4,
            PipelineStage::Feedback => 5,
            PipelineStage::Terminal => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Intake => "intake",
            PipelineStage::Triage => "triage",
            PipelineStage::Policy => "policy",
            PipelineStage::Playbook => "playbook",
            PipelineStage::Step => "step",
            PipelineStage::Feedback => "feedback",
            PipelineStage::Terminal => "terminal",
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ExceptionRow {
    pub tenant_id: String,
    pub exception_id: Uuid,
    pub source_system: String,
    pub domain: String,
    pub exception_type: String,
    pub severity: Severity,
    pub status: ExceptionStatus,
    pub current_stage: PipelineStage,
    pub raw_payload: Value,
    pub normalized_payload: Option<Value>,
    pub current_playbook_id: Option<String>,
    pub current_playbook_version: Option<i32>,
    pub current_step: Option<i32>,
    pub severity_overridden: bool,
    pub required_approvals: i32,
    pub correlation_id: Option<String>,
    pub sla_deadline: Option<DateTime<Utc>>,
    pub last_sla_emitted: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

const EXCEPTION_COLUMNS: &str = r#"
    tenant_id,
    exception_id,
    source_system,
    domain,
    exception_type,
    severity,
    status,
    current_stage,
    raw_payload,
    normalized_payload,
    current_playbook_id,
    current_playbook_version,
    current_step,
    severity_overridden,
    required_approvals,
    correlation_id,
    sla_deadline,
    last_sla_emitted,
    created_at,
    updated_at,
    version
"#;

pub async fn get<'c, E>(
    executor: E,
    tenant_id: &str,
    exception_id: Uuid,
) -> Result<Option<ExceptionRow>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, ExceptionRow>(&format!(
        "SELECT {EXCEPTION_COLUMNS} FROM exceptions WHERE tenant_id = $1 AND exception_id = $2"
    ))
    .bind(tenant_id)
    .bind(exception_id)
    .fetch_optional(executor)
    .await
}

pub struct ListExceptions<'a> {
    pub tenant_id: &'a str,
    pub status: Option<ExceptionStatus>,
    pub domain: Option<&'a str>,
    pub limit: i64,
}

pub async fn list(
    pool: &PgPool,
    filter: ListExceptions<'_>,
) -> Result<Vec<ExceptionRow>, sqlx::Error> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {EXCEPTION_COLUMNS} FROM exceptions WHERE tenant_id = "
    ));
    builder.push_bind(filter.tenant_id);
    if let Some(status) = filter.status {
        builder.push(" AND status = ");
        builder.push_bind(status);
    }
    if let Some(domain) = filter.domain {
        builder.push(" AND domain = ");
        builder.push_bind(domain);
    }
    builder.push(" ORDER BY created_at DESC LIMIT ");
    builder.push_bind(filter.limit);

    builder
        .build_query_as::<ExceptionRow>()
        .fetch_all(pool)
        .await
}

pub struct NewException<'a> {
    pub tenant_id: &'a str,
    pub exception_id: Uuid,
    pub source_system: &'a str,
    pub domain: &'a str,
    pub exception_type: &'a str,
    pub severity: Severity,
    pub raw_payload: &'a Value,
    pub normalized_payload: &'a Value,
    pub correlation_id: Option<&'a str>,
}

/// Creates the aggregate. Returns false when `(tenant_id, exception_id)`
/// already exists, which the intake handler classifies as a stale replay.
pub async fn insert<'c, E>(executor: E, input: NewException<'_>) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO exceptions (
            tenant_id,
            exception_id,
            source_system,
            domain,
            exception_type,
            severity,
            status,
            current_stage,
            raw_payload,
            normalized_payload,
            correlation_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, 'OPEN', 'triage', $7, $8, $9)
        ON CONFLICT (tenant_id, exception_id) DO NOTHING
        "#,
    )
    .bind(input.tenant_id)
    .bind(input.exception_id)
    .bind(input.source_system)
    .bind(input.domain)
    .bind(input.exception_type)
    .bind(input.severity)
    .bind(input.raw_payload)
    .bind(input.normalized_payload)
    .bind(input.correlation_id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Field set applied by a handler commit. Only present fields are written.
#[derive(Debug, Default, Clone)]
pub struct ExceptionUpdate {
    pub severity: Option<Severity>,
    pub status: Option<ExceptionStatus>,
    pub current_stage: Option<PipelineStage>,
    pub normalized_payload: Option<Value>,
    pub current_playbook_id: Option<String>,
    pub current_playbook_version: Option<i32>,
    pub current_step: Option<i32>,
    pub severity_overridden: Option<bool>,
    pub required_approvals: Option<i32>,
    pub sla_deadline: Option<DateTime<Utc>>,
    pub last_sla_emitted: Option<String>,
    pub clear_last_sla_emitted: bool,
}

impl ExceptionUpdate {
    pub fn is_empty(&self) -> bool {
        self.severity.is_none()
            && self.status.is_none()
            && self.current_stage.is_none()
            && self.normalized_payload.is_none()
            && self.current_playbook_id.is_none()
            && self.current_playbook_version.is_none()
            && self.current_step.is_none()
            && self.severity_overridden.is_none()
            && self.required_approvals.is_none()
            && self.sla_deadline.is_none()
            && self.last_sla_emitted.is_none()
            && !self.clear_last_sla_emitted
    }
}

/// Compare-and-set write. Returns false when the row moved past
/// `expected_version`, in which case the caller re-reads and re-evaluates.
pub async fn apply_update<'c, E>(
    executor: E,
    tenant_id: &str,
    exception_id: Uuid,
    expected_version: i64,
    update: &ExceptionUpdate,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let mut builder =
        QueryBuilder::new("UPDATE exceptions SET version = version + 1, updated_at = NOW()");
    if let Some(severity) = update.severity {
        builder.push(", severity = ");
        builder.push_bind(severity);
    }
    if let Some(status) = update.status {
        builder.push(", status = ");
        builder.push_bind(status);
    }
    if let Some(stage) = update.current_stage {
        builder.push(", current_stage = ");
        builder.push_bind(stage);
    }
    if let Some(payload) = &update.normalized_payload {
        builder.push(", normalized_payload = ");
        builder.push_bind(payload);
    }
    if let Some(playbook_id) = &update.current_playbook_id {
        builder.push(", current_playbook_id = ");
        builder.push_bind(playbook_id);
    }
    if let Some(playbook_version) = update.current_playbook_version {
        builder.push(", current_playbook_version = ");
        builder.push_bind(playbook_version);
    }
    if let Some(step) = update.current_step {
        builder.push(", current_step = ");
        builder.push_bind(step);
    }
    if let Some(overridden) = update.severity_overridden {
        builder.push(", severity_overridden = ");
        builder.push_bind(overridden);
    }
    if let Some(approvals) = update.required_approvals {
        builder.push(", required_approvals = ");
        builder.push_bind(approvals);
    }
    if let Some(deadline) = update.sla_deadline {
        builder.push(", sla_deadline = ");
        builder.push_bind(deadline);
        builder.push(", last_sla_emitted = NULL");
    }
    if let Some(marker) = &update.last_sla_emitted {
        builder.push(", last_sla_emitted = ");
        builder.push_bind(marker);
    } else if update.clear_last_sla_emitted {
        builder.push(", last_sla_emitted = NULL");
    }
    builder.push(" WHERE tenant_id = ");
    builder.push_bind(tenant_id);
    builder.push(" AND exception_id = ");
    builder.push_bind(exception_id);
    builder.push(" AND version = ");
    builder.push_bind(expected_version);

    let result = builder.build().execute(executor).await?;
    Ok(result.rows_affected() == 1)
}

/// Non-terminal exceptions with an armed deadline inside the scan horizon,
/// ordered soonest first. Input to the SLA monitor tick.
pub async fn sla_candidates(
    pool: &PgPool,
    horizon: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<ExceptionRow>, sqlx::Error> {
    sqlx::query_as::<_, ExceptionRow>(&format!(
        r#"
        SELECT {EXCEPTION_COLUMNS}
        FROM exceptions
        WHERE sla_deadline IS NOT NULL
          AND sla_deadline <= $1
          AND status NOT IN ('RESOLVED', 'CLOSED')
          AND (last_sla_emitted IS NULL OR last_sla_emitted <> 'expired')
        ORDER BY sla_deadline
        LIMIT $2
        "#
    ))
    .bind(horizon)
    .bind(limit)
    .fetch_all(pool)
    .await
}

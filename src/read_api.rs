use axum::{
    extract::{Extension, Path, Query},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::broker::{self, LoggedMessage};
use crate::db::exception_events::ExceptionEventRow;
use crate::db::exception_feedback::FeedbackRow;
use crate::db::exceptions::{self, ExceptionRow, ExceptionStatus};
use crate::db::playbook_progress::PlaybookProgressRow;
use crate::db::tool_executions::ToolExecutionRow;
use crate::db::{exception_events, exception_feedback, playbook_progress, tool_executions};
use crate::envelope::topics;
use crate::error::{AppError, AppResult};

/// Full operator projection of one exception: the aggregate, its timeline,
/// playbook progress, tool executions, and feedback. Reads see a commit
/// before its outbound envelopes are delivered.
#[derive(Debug, Serialize)]
pub struct ExceptionDetail {
    pub exception: ExceptionRow,
    pub events: Vec<ExceptionEventRow>,
    pub playbook_progress: Vec<PlaybookProgressRow>,
    pub tool_executions: Vec<ToolExecutionRow>,
    pub feedback: Vec<FeedbackRow>,
}

pub async fn exception_detail(
    pool: &PgPool,
    tenant_id: &str,
    exception_id: Uuid,
) -> AppResult<ExceptionDetail> {
    let exception = exceptions::get(pool, tenant_id, exception_id)
        .await?
        .ok_or(AppError::NotFound)?;
    let events = exception_events::list(pool, tenant_id, exception_id).await?;
    let progress = playbook_progress::list(pool, tenant_id, exception_id).await?;
    let executions = tool_executions::list_for_exception(pool, tenant_id, exception_id).await?;
    let feedback = exception_feedback::list(pool, tenant_id, exception_id).await?;
    Ok(ExceptionDetail {
        exception,
        events,
        playbook_progress: progress,
        tool_executions: executions,
        feedback,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<ExceptionStatus>,
    pub domain: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_exceptions(
    pool: &PgPool,
    tenant_id: &str,
    query: ListQuery,
) -> AppResult<Vec<ExceptionRow>> {
    let rows = exceptions::list(
        pool,
        exceptions::ListExceptions {
            tenant_id,
            status: query.status,
            domain: query.domain.as_deref(),
            limit: query.limit.unwrap_or(100).clamp(1, 500),
        },
    )
    .await?;
    Ok(rows)
}

/// Messages the platform refused or exhausted retries on, newest first.
pub async fn list_dlq(pool: &PgPool, limit: i64) -> AppResult<Vec<LoggedMessage>> {
    Ok(broker::read_topic(pool, topics::CONTROL_DLQ, limit.clamp(1, 500)).await?)
}

async fn get_exception(
    Extension(pool): Extension<PgPool>,
    Path((tenant_id, exception_id)): Path<(String, Uuid)>,
) -> AppResult<Json<ExceptionDetail>> {
    Ok(Json(exception_detail(&pool, &tenant_id, exception_id).await?))
}

async fn get_exceptions(
    Extension(pool): Extension<PgPool>,
    Path(tenant_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<ExceptionRow>>> {
    Ok(Json(list_exceptions(&pool, &tenant_id, query).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct DlqQuery {
    pub limit: Option<i64>,
}

async fn get_dlq(
    Extension(pool): Extension<PgPool>,
    Query(query): Query<DlqQuery>,
) -> AppResult<Json<Vec<LoggedMessage>>> {
    Ok(Json(list_dlq(&pool, query.limit.unwrap_or(100)).await?))
}

pub fn router() -> Router {
    Router::new()
        .route("/api/exceptions/:tenant_id", get(get_exceptions))
        .route(
            "/api/exceptions/:tenant_id/:exception_id",
            get(get_exception),
        )
        .route("/api/ops/dlq", get(get_dlq))
}

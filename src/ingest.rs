use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::broker::Broker;
use crate::envelope::{event_types, topics, EventEnvelope};
use crate::error::{AppError, AppResult};

/// One exception submission from a source system.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub tenant_id: String,
    pub source_system: String,
    pub raw_payload: Value,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub exception_id: Option<Uuid>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub exception_id: Uuid,
    pub accepted_at: DateTime<Utc>,
}

/// Accepts one exception and publishes it to `exceptions.ingested`. The
/// pipeline picks it up from there; acceptance is not processing.
pub async fn accept(broker: &dyn Broker, request: IngestRequest) -> AppResult<IngestResponse> {
    if request.tenant_id.trim().is_empty() {
        return Err(AppError::BadRequest("tenant_id is required".into()));
    }
    if request.source_system.trim().is_empty() {
        return Err(AppError::BadRequest("source_system is required".into()));
    }
    if !request.raw_payload.is_object() {
        return Err(AppError::BadRequest("raw_payload must be a JSON object".into()));
    }

    let exception_id = request.exception_id.unwrap_or_else(Uuid::new_v4);
    let correlation_id = request
        .correlation_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let domain = request.domain.unwrap_or_else(|| "default".to_string());

    let envelope = EventEnvelope::new(
        event_types::EXCEPTION_INGESTED,
        &request.tenant_id,
        exception_id,
        "ingest",
        &correlation_id,
        json!({
            "source_system": request.source_system,
            "domain": domain,
            "raw_payload": request.raw_payload,
        }),
    );
    let accepted_at = envelope.occurred_at;
    broker
        .publish(topics::EXCEPTIONS_INGESTED, &envelope.partition_key(), &envelope)
        .await?;

    Ok(IngestResponse {
        exception_id,
        accepted_at,
    })
}

#[derive(Debug, Deserialize)]
pub struct StepCompletionRequest {
    pub outcome: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub actor_id: Option<String>,
}

/// Operator acknowledgement of a manual step.
pub async fn submit_step_completion(
    broker: &dyn Broker,
    tenant_id: &str,
    exception_id: Uuid,
    step_order: i32,
    request: StepCompletionRequest,
) -> AppResult<()> {
    if !matches!(request.outcome.as_str(), "success" | "failed" | "skipped") {
        return Err(AppError::BadRequest(format!(
            "unknown step outcome `{}`",
            request.outcome
        )));
    }
    let envelope = EventEnvelope::new(
        event_types::STEP_COMPLETED,
        tenant_id,
        exception_id,
        "ingest",
        &Uuid::new_v4().to_string(),
        json!({
            "step_order": step_order,
            "outcome": request.outcome,
            "notes": request.notes,
            "actor_id": request.actor_id,
        }),
    );
    broker
        .publish(topics::STEP_COMPLETED, &envelope.partition_key(), &envelope)
        .await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub verdict: String,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub actor_id: Option<String>,
}

pub async fn submit_feedback(
    broker: &dyn Broker,
    tenant_id: &str,
    exception_id: Uuid,
    request: FeedbackRequest,
) -> AppResult<()> {
    if !matches!(request.verdict.as_str(), "correct" | "incorrect") {
        return Err(AppError::BadRequest(format!(
            "unknown verdict `{}`",
            request.verdict
        )));
    }
    let envelope = EventEnvelope::new(
        event_types::FEEDBACK_CAPTURED,
        tenant_id,
        exception_id,
        "ingest",
        &Uuid::new_v4().to_string(),
        json!({
            "verdict": request.verdict,
            "rationale": request.rationale,
            "actor_id": request.actor_id,
        }),
    );
    broker
        .publish(topics::FEEDBACK_CAPTURED, &envelope.partition_key(), &envelope)
        .await?;
    Ok(())
}

/// Forces a policy re-evaluation of a live exception.
pub async fn request_recalculation(
    broker: &dyn Broker,
    tenant_id: &str,
    exception_id: Uuid,
) -> AppResult<()> {
    let envelope = EventEnvelope::new(
        event_types::POLICY_REQUESTED,
        tenant_id,
        exception_id,
        "ingest",
        &Uuid::new_v4().to_string(),
        json!({ "reason": "recalculate_requested" }),
    );
    broker
        .publish(topics::POLICY_REQUESTED, &envelope.partition_key(), &envelope)
        .await?;
    Ok(())
}

async fn post_ingest(
    Extension(broker): Extension<Arc<dyn Broker>>,
    Json(request): Json<IngestRequest>,
) -> AppResult<Json<IngestResponse>> {
    Ok(Json(accept(broker.as_ref(), request).await?))
}

async fn post_step_completion(
    Extension(broker): Extension<Arc<dyn Broker>>,
    Path((tenant_id, exception_id, step_order)): Path<(String, Uuid, i32)>,
    Json(request): Json<StepCompletionRequest>,
) -> AppResult<Json<Value>> {
    submit_step_completion(broker.as_ref(), &tenant_id, exception_id, step_order, request).await?;
    Ok(Json(json!({ "accepted": true })))
}

async fn post_feedback(
    Extension(broker): Extension<Arc<dyn Broker>>,
    Path((tenant_id, exception_id)): Path<(String, Uuid)>,
    Json(request): Json<FeedbackRequest>,
) -> AppResult<Json<Value>> {
    submit_feedback(broker.as_ref(), &tenant_id, exception_id, request).await?;
    Ok(Json(json!({ "accepted": true })))
}

async fn post_recalculate(
    Extension(broker): Extension<Arc<dyn Broker>>,
    Path((tenant_id, exception_id)): Path<(String, Uuid)>,
) -> AppResult<Json<Value>> {
    request_recalculation(broker.as_ref(), &tenant_id, exception_id).await?;
    Ok(Json(json!({ "accepted": true })))
}

pub fn router() -> Router {
    Router::new()
        .route("/api/ingest", post(post_ingest))
        .route(
            "/api/exceptions/:tenant_id/:exception_id/steps/:step_order/complete",
            post(post_step_completion),
        )
        .route(
            "/api/exceptions/:tenant_id/:exception_id/feedback",
            post(post_feedback),
        )
        .route(
            "/api/exceptions/:tenant_id/:exception_id/recalculate",
            post(post_recalculate),
        )
}

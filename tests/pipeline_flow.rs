mod harness;

use harness::{PipelineHarness, DOMAIN, TENANT};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use backend::db::exceptions::{self, ExceptionStatus, PipelineStage};
use backend::db::playbook_progress::{self, StepStatus};
use backend::db::tool_executions::{self, ToolExecutionStatus};
use backend::envelope::topics;
use backend::ingest::{self, FeedbackRequest};

#[sqlx::test]
async fn automated_resolution_happy_path(pool: PgPool) {
    let harness = PipelineHarness::new(pool).await;
    harness.seed_default_config().await;

    let exception_id = harness
        .ingest(json!({"type": "SETTLEMENT_FAIL", "amount": 1000, "counterparty": "ACME"}))
        .await;
    harness.pump_until_quiet().await;

    let row = exceptions::get(&harness.pool, TENANT, exception_id)
        .await
        .unwrap()
        .expect("exception exists");
    assert_eq!(row.status, ExceptionStatus::Resolved);
    assert_eq!(row.current_stage, PipelineStage::Feedback);
    assert_eq!(row.severity.as_str(), "HIGH");
    assert_eq!(row.current_playbook_id.as_deref(), Some("PB_SETTLE"));
    assert_eq!(row.current_playbook_version, Some(3));
    assert_eq!(row.current_step, Some(3));
    assert!(row.sla_deadline.is_some(), "triage armed the SLA deadline");
    assert_eq!(row.domain, DOMAIN);

    // The timeline reads in pipeline order; per-step triples repeat.
    let types = harness.timeline_types(TENANT, exception_id).await;
    let expected = [
        "ExceptionCreated",
        "ExceptionNormalized",
        "TriageCompleted",
        "PolicyCompleted",
        "PlaybookMatched",
        "StepRequested",
        "ToolRequested",
        "ToolCompleted",
        "StepCompleted",
        "StepRequested",
        "ToolRequested",
        "ToolCompleted",
        "StepCompleted",
        "StepRequested",
        "ToolRequested",
        "ToolCompleted",
        "StepCompleted",
        "PlaybookCompleted",
    ];
    assert_eq!(types, expected);

    // Step progression: +1 per completion, no skips, no regressions.
    let steps = playbook_progress::list(&harness.pool, TENANT, exception_id)
        .await
        .unwrap();
    assert_eq!(steps.len(), 3);
    for (index, step) in steps.iter().enumerate() {
        assert_eq!(step.step_order, index as i32 + 1);
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.completed_at.is_some());
    }

    let executions = tool_executions::list_for_exception(&harness.pool, TENANT, exception_id)
        .await
        .unwrap();
    assert_eq!(executions.len(), 3);
    assert!(executions
        .iter()
        .all(|x| x.status == ToolExecutionStatus::Succeeded));
}

#[sqlx::test]
async fn confirmed_feedback_closes_the_exception(pool: PgPool) {
    let harness = PipelineHarness::new(pool).await;
    harness.seed_default_config().await;

    let exception_id = harness
        .ingest(json!({"type": "SETTLEMENT_FAIL", "amount": 250, "counterparty": "ACME"}))
        .await;
    harness.pump_until_quiet().await;

    ingest::submit_feedback(
        harness.broker.as_ref(),
        TENANT,
        exception_id,
        FeedbackRequest {
            verdict: "correct".into(),
            rationale: Some("resolution verified".into()),
            actor_id: Some("ops-7".into()),
        },
    )
    .await
    .unwrap();
    harness.pump_until_quiet().await;

    let row = exceptions::get(&harness.pool, TENANT, exception_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, ExceptionStatus::Closed);
    assert_eq!(row.current_stage, PipelineStage::Terminal);

    let types = harness.timeline_types(TENANT, exception_id).await;
    assert!(types.contains(&"FeedbackCaptured".to_string()));
    assert!(types.contains(&"ExceptionClosed".to_string()));
}

#[sqlx::test]
async fn duplicate_ingest_creates_one_exception(pool: PgPool) {
    let harness = PipelineHarness::new(pool).await;
    harness.seed_default_config().await;

    let exception_id = Uuid::new_v4();
    let payload = json!({"type": "SETTLEMENT_FAIL", "amount": 1000, "counterparty": "ACME"});
    harness
        .ingest_as(TENANT, payload.clone(), Some(exception_id))
        .await;
    harness
        .ingest_as(TENANT, payload, Some(exception_id))
        .await;
    harness.pump_until_quiet().await;

    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM exceptions WHERE tenant_id = $1 AND exception_id = $2",
    )
    .bind(TENANT)
    .bind(exception_id)
    .fetch_one(&harness.pool)
    .await
    .unwrap();
    assert_eq!(count, 1);

    // The duplicate was classified StalePrecondition and diverted.
    let dlq = backend::broker::read_topic(&harness.pool, topics::CONTROL_DLQ, 10)
        .await
        .unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(
        dlq[0].envelope["payload"]["reason"],
        json!("StalePrecondition")
    );

    // And processing still ran to completion exactly once.
    let row = exceptions::get(&harness.pool, TENANT, exception_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, ExceptionStatus::Resolved);
    let completions: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM exception_events WHERE tenant_id = $1 AND exception_id = $2 AND event_type = 'PlaybookCompleted'",
    )
    .bind(TENANT)
    .bind(exception_id)
    .fetch_one(&harness.pool)
    .await
    .unwrap();
    assert_eq!(completions, 1);
}

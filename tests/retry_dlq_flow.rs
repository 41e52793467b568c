mod harness;

use harness::{PipelineHarness, DOMAIN, TENANT};
use serde_json::json;
use sqlx::PgPool;

use backend::db::exceptions::{self, ExceptionStatus};
use backend::db::tool_executions::{self, ToolExecutionStatus};
use backend::envelope::topics;

fn catalog_with_flaky_tool() -> serde_json::Value {
    json!({
        "playbooks": [
            {"playbook_id": "PB_SETTLE", "version": 3, "name": "settlement repair",
             "match": {"exception_types": ["SETTLEMENT_FAIL"], "min_severity": "MEDIUM"},
             "steps": [
                {"step_order": 1, "name": "verify-ssi", "action_type": "tool",
                 "action_config": {"tool_id": "ssi-verify",
                                   "simulate": {"transient_failures": 2}}}
             ]}
        ]
    })
}

#[sqlx::test]
async fn transient_tool_failure_retries_to_success(pool: PgPool) {
    let harness = PipelineHarness::new(pool).await;
    harness
        .seed_config(
            TENANT,
            DOMAIN,
            harness::default_domain_pack(),
            harness::default_policy_pack(),
            catalog_with_flaky_tool(),
        )
        .await;

    let exception_id = harness
        .ingest(json!({"type": "SETTLEMENT_FAIL", "amount": 1000, "counterparty": "ACME"}))
        .await;
    harness.pump_until_quiet().await;

    let row = exceptions::get(&harness.pool, TENANT, exception_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, ExceptionStatus::Resolved);

    // Two dead attempts, one success; the worker-level retries republished
    // the request with incremented delivery attempts.
    let executions = tool_executions::list_for_exception(&harness.pool, TENANT, exception_id)
        .await
        .unwrap();
    assert_eq!(executions.len(), 3);
    assert_eq!(
        executions
            .iter()
            .filter(|x| x.status == ToolExecutionStatus::Failed)
            .count(),
        2
    );
    assert_eq!(
        executions
            .iter()
            .filter(|x| x.status == ToolExecutionStatus::Succeeded)
            .count(),
        1
    );

    let events = backend::db::exception_events::list(&harness.pool, TENANT, exception_id)
        .await
        .unwrap();
    let transient_errors: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == "ProcessingError")
        .collect();
    assert_eq!(transient_errors.len(), 2);
    assert!(transient_errors
        .iter()
        .all(|e| e.payload["kind"] == json!("Transient")));

    let successes = events
        .iter()
        .filter(|e| {
            e.event_type == "ToolCompleted" && e.payload["success"] == json!(true)
        })
        .count();
    assert_eq!(successes, 1);

    // The retried envelopes carried incremented attempts onto the original
    // topic.
    let requests = backend::broker::read_topic(&harness.pool, topics::TOOL_REQUESTED, 10)
        .await
        .unwrap();
    let mut attempts: Vec<i64> = requests
        .iter()
        .map(|m| m.envelope["attempt"].as_i64().unwrap())
        .collect();
    attempts.sort_unstable();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[sqlx::test]
async fn poison_message_goes_to_dlq_without_state(pool: PgPool) {
    let harness = PipelineHarness::new(pool).await;
    harness.seed_default_config().await;

    // Missing the type discriminator entirely.
    let exception_id = harness.ingest(json!({"amount": 123})).await;
    harness.pump_until_quiet().await;

    assert!(exceptions::get(&harness.pool, TENANT, exception_id)
        .await
        .unwrap()
        .is_none());

    let dlq = backend::broker::read_topic(&harness.pool, topics::CONTROL_DLQ, 10)
        .await
        .unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].envelope["payload"]["reason"], json!("Permanent"));
    assert_eq!(
        dlq[0].envelope["payload"]["original_topic"],
        json!(topics::EXCEPTIONS_INGESTED)
    );

    // Operators still see what happened on the timeline.
    let events = backend::db::exception_events::list(&harness.pool, TENANT, exception_id)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "ProcessingError");
    assert_eq!(events[0].payload["kind"], json!("Permanent"));
}

#[sqlx::test]
async fn exhausted_retries_divert_to_dlq(pool: PgPool) {
    let harness = PipelineHarness::new(pool).await;
    harness
        .seed_config(
            TENANT,
            DOMAIN,
            harness::default_domain_pack(),
            harness::default_policy_pack(),
            json!({
                "playbooks": [
                    {"playbook_id": "PB_SETTLE", "version": 3, "name": "settlement repair",
                     "match": {"exception_types": ["SETTLEMENT_FAIL"], "min_severity": "MEDIUM"},
                     "steps": [
                        {"step_order": 1, "name": "verify-ssi", "action_type": "tool",
                         "action_config": {"tool_id": "ssi-verify",
                                           "simulate": {"transient_failures": 99}}}
                     ]}
                ]
            }),
        )
        .await;

    let exception_id = harness
        .ingest(json!({"type": "SETTLEMENT_FAIL", "amount": 1000, "counterparty": "ACME"}))
        .await;
    harness.pump_until_quiet().await;

    // The default budget is five attempts including the first.
    let dlq = backend::broker::read_topic(&harness.pool, topics::CONTROL_DLQ, 10)
        .await
        .unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].envelope["payload"]["reason"], json!("RetriesExhausted"));
    assert_eq!(
        dlq[0].envelope["payload"]["envelope"]["attempt"],
        json!(5)
    );

    // The exception is parked mid-playbook, not corrupted.
    let row = exceptions::get(&harness.pool, TENANT, exception_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, ExceptionStatus::InProgress);
}

mod harness;

use harness::{PipelineHarness, TENANT};
use serde_json::json;
use sqlx::PgPool;

use backend::broker::Broker;
use backend::db::exceptions::{self, ExceptionStatus};
use backend::envelope::{topics, EventEnvelope};
use backend::runtime;

/// Replaying a processed envelope must change nothing: same terminal state,
/// same timeline, the duplicate acknowledged as stale.
#[sqlx::test]
async fn replayed_envelope_is_absorbed(pool: PgPool) {
    let harness = PipelineHarness::new(pool).await;
    harness.seed_default_config().await;

    let exception_id = harness
        .ingest(json!({"type": "SETTLEMENT_FAIL", "amount": 1000, "counterparty": "ACME"}))
        .await;
    harness.pump_until_quiet().await;

    let before_row = exceptions::get(&harness.pool, TENANT, exception_id)
        .await
        .unwrap()
        .unwrap();
    let before_timeline = harness.timeline_types(TENANT, exception_id).await;
    assert_eq!(before_row.status, ExceptionStatus::Resolved);

    // Pull the normalized envelope off the log and deliver it again, as a
    // broker redelivery would.
    let normalized: Vec<_> =
        backend::broker::read_topic(&harness.pool, topics::EXCEPTIONS_NORMALIZED, 10)
            .await
            .unwrap();
    assert_eq!(normalized.len(), 1);
    let envelope: EventEnvelope =
        serde_json::from_value(normalized[0].envelope.clone()).unwrap();
    harness
        .broker
        .publish(topics::EXCEPTIONS_NORMALIZED, &envelope.partition_key(), &envelope)
        .await
        .unwrap();
    harness.pump_until_quiet().await;

    let after_row = exceptions::get(&harness.pool, TENANT, exception_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after_row.status, before_row.status);
    assert_eq!(after_row.current_step, before_row.current_step);

    // The timeline gains only the stale-replay error row, nothing else.
    let after_timeline = harness.timeline_types(TENANT, exception_id).await;
    let extra: Vec<_> = after_timeline
        .iter()
        .filter(|t| !matches!(t.as_str(), "ProcessingError"))
        .collect();
    assert_eq!(extra.len(), before_timeline.len());

    let dlq = backend::broker::read_topic(&harness.pool, topics::CONTROL_DLQ, 10)
        .await
        .unwrap();
    assert!(dlq
        .iter()
        .any(|m| m.envelope["payload"]["reason"] == json!("StalePrecondition")));
}

#[sqlx::test]
async fn replay_hook_republishes_the_stored_envelope(pool: PgPool) {
    let harness = PipelineHarness::new(pool).await;
    harness.seed_default_config().await;

    let exception_id = harness
        .ingest(json!({"type": "SETTLEMENT_FAIL", "amount": 1000, "counterparty": "ACME"}))
        .await;
    harness.pump_until_quiet().await;

    let replayed = runtime::replay_exception(
        &harness.pool,
        harness.broker.as_ref(),
        TENANT,
        exception_id,
        topics::EXCEPTIONS_INGESTED,
    )
    .await
    .unwrap();
    assert!(replayed);

    // The replay runs back through intake and is absorbed as a duplicate
    // create, never a second aggregate.
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

    // Nothing stored on an unknown topic yields no replay.
    let missing = runtime::replay_exception(
        &harness.pool,
        harness.broker.as_ref(),
        TENANT,
        exception_id,
        "no.such.topic",
    )
    .await
    .unwrap();
    assert!(!missing);
}

mod harness;

use chrono::Utc;
use harness::{PipelineHarness, TENANT};
use serde_json::json;
use sqlx::PgPool;

use backend::config::WorkerRole;
use backend::db::exceptions::{self, ExceptionStatus, PipelineStage};
use backend::envelope::topics;
use backend::sla_monitor;

/// Scenario: the step workers are down when the deadline passes. The
/// monitor escalates exactly once; the recovered worker finds its pending
/// `step.requested` stale.
#[sqlx::test]
async fn expiry_with_crashed_step_workers(pool: PgPool) {
    let harness = PipelineHarness::new(pool).await;
    harness.seed_default_config().await;

    let exception_id = harness
        .ingest(json!({"type": "SETTLEMENT_FAIL", "amount": 1000, "counterparty": "ACME"}))
        .await;
    // Everything but the step and tool roles runs; the playbook is matched
    // and step 1 is requested but never picked up.
    harness
        .pump_without(&[WorkerRole::Step, WorkerRole::Tool])
        .await;

    let row = exceptions::get(&harness.pool, TENANT, exception_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.current_stage, PipelineStage::Step);

    // Force the deadline into the past, then tick the monitor twice.
    sqlx::query(
        "UPDATE exceptions SET sla_deadline = NOW() - INTERVAL '5 seconds' WHERE exception_id = $1",
    )
    .bind(exception_id)
    .execute(&harness.pool)
    .await
    .unwrap();

    let monitor_ctx = harness.context(WorkerRole::Policy).clone();
    let first = sla_monitor::process_tick(&monitor_ctx, Utc::now()).await.unwrap();
    assert_eq!(first.expired, 1);
    let second = sla_monitor::process_tick(&monitor_ctx, Utc::now()).await.unwrap();
    assert_eq!(second.expired, 0, "expiry is emitted exactly once");

    backend::outbox::publish_batch(&harness.pool, harness.broker.as_ref())
        .await
        .unwrap();

    let expired = backend::broker::read_topic(&harness.pool, topics::SLA_EXPIRED, 10)
        .await
        .unwrap();
    assert_eq!(expired.len(), 1);

    let row = exceptions::get(&harness.pool, TENANT, exception_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, ExceptionStatus::Escalated);
    assert_eq!(row.last_sla_emitted.as_deref(), Some("expired"));

    // Workers recover: the parked step.requested is acked as stale and
    // diverted, with no state mutation.
    harness.pump_until_quiet().await;
    let row = exceptions::get(&harness.pool, TENANT, exception_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, ExceptionStatus::Escalated);

    let dlq = backend::broker::read_topic(&harness.pool, topics::CONTROL_DLQ, 10)
        .await
        .unwrap();
    assert!(dlq
        .iter()
        .any(|m| m.envelope["payload"]["reason"] == json!("StalePrecondition")));
}

#[sqlx::test]
async fn imminent_window_fires_once_per_armed_deadline(pool: PgPool) {
    let harness = PipelineHarness::new(pool).await;
    harness.seed_default_config().await;

    let exception_id = harness
        .ingest(json!({"type": "SETTLEMENT_FAIL", "amount": 1000, "counterparty": "ACME"}))
        .await;
    harness
        .pump_without(&[WorkerRole::Step, WorkerRole::Tool])
        .await;

    // Inside the 10 minute imminent window, but not yet passed.
    sqlx::query(
        "UPDATE exceptions SET sla_deadline = NOW() + INTERVAL '5 minutes' WHERE exception_id = $1",
    )
    .bind(exception_id)
    .execute(&harness.pool)
    .await
    .unwrap();

    let monitor_ctx = harness.context(WorkerRole::Policy).clone();
    let first = sla_monitor::process_tick(&monitor_ctx, Utc::now()).await.unwrap();
    assert_eq!(first.imminent, 1);
    assert_eq!(first.expired, 0);
    let second = sla_monitor::process_tick(&monitor_ctx, Utc::now()).await.unwrap();
    assert_eq!(second.imminent, 0, "one imminent emission per window");

    let row = exceptions::get(&harness.pool, TENANT, exception_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.last_sla_emitted.as_deref(), Some("imminent"));
    assert_ne!(row.status, ExceptionStatus::Escalated);

    // Re-arming the deadline clears the marker for the next window.
    let mut update = backend::db::exceptions::ExceptionUpdate::default();
    update.sla_deadline = Some(Utc::now() + chrono::Duration::minutes(30));
    backend::db::exceptions::apply_update(
        &harness.pool,
        TENANT,
        exception_id,
        row.version,
        &update,
    )
    .await
    .unwrap();
    let row = exceptions::get(&harness.pool, TENANT, exception_id)
        .await
        .unwrap()
        .unwrap();
    assert!(row.last_sla_emitted.is_none());
}

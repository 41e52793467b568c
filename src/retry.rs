use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, PgBroker};
use crate::config::{self, WorkerRole};
use crate::envelope::{event_types, topics, EventEnvelope, RetryDirective};

/// Declarative per-role retry policy. `max_attempts` counts the first
/// attempt: an envelope delivered with `attempt >= max_attempts` that fails
/// again goes to the DLQ.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn for_role(role: WorkerRole) -> Self {
        let defaults = RetryPolicy::default();
        let prefix = format!("RETRY_{}", role.as_str().to_ascii_uppercase());
        RetryPolicy {
            max_attempts: env_override(&format!("{prefix}_MAX_ATTEMPTS"), defaults.max_attempts),
            base_backoff: Duration::from_millis(env_override(
                &format!("{prefix}_BASE_BACKOFF_MS"),
                defaults.base_backoff.as_millis() as u64,
            )),
            multiplier: defaults.multiplier,
            max_backoff: defaults.max_backoff,
            jitter: defaults.jitter,
        }
    }

    /// Exponential backoff with ±jitter for the given (1-based) attempt.
    pub fn backoff(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 30);
        let raw = self.base_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_backoff.as_secs_f64());
        let spread = capped * self.jitter;
        let jittered = if spread > 0.0 {
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }

    pub fn attempts_exhausted(&self, attempt: i32) -> bool {
        attempt >= self.max_attempts
    }
}

fn env_override<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

/// Wraps a failed envelope into a `retry.scheduled` directive on
/// `control.retry`, with the re-delivery attempt already incremented.
pub async fn schedule(
    broker: &dyn Broker,
    policy: &RetryPolicy,
    delivery_topic: &str,
    failed: &EventEnvelope,
    error_kind: &str,
    error: &str,
) -> Result<(), crate::error::BrokerError> {
    let next_attempt = failed.attempt + 1;
    let not_before = Utc::now()
        + chrono::Duration::from_std(policy.backoff(failed.attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(1));
    let directive = RetryDirective {
        original_topic: delivery_topic.to_string(),
        not_before,
        error_kind: error_kind.to_string(),
        error: error.to_string(),
        envelope: failed.with_attempt(next_attempt),
    };
    let wrapper = EventEnvelope::new(
        event_types::RETRY_SCHEDULED,
        &failed.tenant_id,
        failed.exception_id,
        "retry",
        &failed.correlation_id,
        serde_json::to_value(&directive)?,
    );
    info!(
        topic = delivery_topic,
        exception_id = %failed.exception_id,
        attempt = next_attempt,
        not_before = %not_before,
        "scheduling retry"
    );
    broker
        .publish(topics::CONTROL_RETRY, &wrapper.partition_key(), &wrapper)
        .await
}

/// Consumes `control.retry` and parks each directive in `retry_schedule`
/// until it is due. Group `retry-workers`; replicated instances share it.
pub fn spawn_controller(
    pool: PgPool,
    broker: Arc<PgBroker>,
    consumer_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let poll = Duration::from_millis(*config::BROKER_POLL_MILLIS);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let fetched = broker
                .fetch("retry-workers", &[topics::CONTROL_RETRY], &consumer_id)
                .await;
            match fetched {
                Ok(Some(delivery)) => {
                    if let Err(err) = park_directive(&pool, &delivery.envelope).await {
                        error!(?err, "failed to park retry directive; releasing");
                        let _ = broker.release(&delivery).await;
                        sleep(poll).await;
                        continue;
                    }
                    if let Err(err) = broker.ack(&delivery).await {
                        warn!(?err, "retry controller ack failed");
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = sleep(poll) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(err) => {
                    error!(?err, "retry controller fetch failed");
                    sleep(poll).await;
                }
            }
        }
    })
}

/// Unwraps a `retry.scheduled` wrapper into the `retry_schedule` table.
pub async fn park_directive(pool: &PgPool, wrapper: &EventEnvelope) -> anyhow::Result<()> {
    let directive: RetryDirective = serde_json::from_value(wrapper.payload.clone())?;
    let envelope = serde_json::to_value(&directive.envelope)?;
    sqlx::query(
        r#"
        INSERT INTO retry_schedule (topic, msg_key, envelope, not_before)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(&directive.original_topic)
    .bind(directive.envelope.partition_key())
    .bind(&envelope)
    .bind(directive.not_before)
    .execute(pool)
    .await?;
    Ok(())
}

/// Re-publishes parked envelopes to their original topics once due.
pub fn spawn_dispatcher(
    pool: PgPool,
    broker: Arc<dyn Broker>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_millis(*config::RETRY_DISPATCH_MILLIS);
        loop {
            if *shutdown.borrow() {
                break;
            }
            match dispatch_due(&pool, broker.as_ref()).await {
                Ok(count) if count > 0 => {
                    debug!(count, "re-published due retries");
                    continue;
                }
                Ok(_) => {}
                Err(err) => error!(?err, "retry dispatch batch failed"),
            }
            tokio::select! {
                _ = sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    })
}

pub async fn dispatch_due(pool: &PgPool, broker: &dyn Broker) -> anyhow::Result<usize> {
    let mut tx = pool.begin().await?;
    let rows = sqlx::query(
        r#"
        SELECT id, topic, msg_key, envelope
        FROM retry_schedule
        WHERE not_before <= NOW()
        ORDER BY not_before
        LIMIT 50
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .fetch_all(&mut tx)
    .await?;

    let mut dispatched = 0usize;
    for row in rows {
        let id: i64 = row.get("id");
        let topic: String = row.get("topic");
        let key: String = row.get("msg_key");
        let body: Value = row.get("envelope");
        match serde_json::from_value::<EventEnvelope>(body) {
            Ok(envelope) => {
                broker.publish(&topic, &key, &envelope).await?;
                dispatched += 1;
            }
            Err(err) => warn!(id, ?err, "dropping unreadable retry row"),
        }
        sqlx::query("DELETE FROM retry_schedule WHERE id = $1")
            .bind(id)
            .execute(&mut tx)
            .await?;
    }
    tx.commit().await?;
    Ok(dispatched)
}

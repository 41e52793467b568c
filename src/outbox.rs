use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres, Row};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::broker::Broker;
use crate::config;
use crate::envelope::EventEnvelope;

/// Stages an outbound envelope inside the caller's state transaction. The
/// publisher drains it after commit, so the broker never sees an envelope
/// whose state mutation did not land.
pub async fn enqueue<'c, E>(
    executor: E,
    topic: &str,
    key: &str,
    envelope: &EventEnvelope,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let body = serde_json::to_value(envelope).unwrap_or(Value::Null);
    sqlx::query(
        r#"
        INSERT INTO outbox (topic, msg_key, envelope)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(topic)
    .bind(key)
    .bind(&body)
    .execute(executor)
    .await?;
    Ok(())
}

/// Drains pending outbox rows to the broker. Safe to run in every worker
/// process; an advisory lock keeps one drainer active at a time so per-key
/// FIFO order is preserved.
pub fn spawn_publisher(
    pool: PgPool,
    broker: Arc<dyn Broker>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_millis(*config::OUTBOX_POLL_MILLIS);
        loop {
            if *shutdown.borrow() {
                break;
            }
            match publish_batch(&pool, broker.as_ref()).await {
                Ok(published) if published > 0 => {
                    debug!(published, "outbox batch drained");
                    continue;
                }
                Ok(_) => {}
                Err(err) => error!(?err, "outbox publisher batch failed"),
            }
            tokio::select! {
                _ = sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    })
}

pub async fn publish_batch(pool: &PgPool, broker: &dyn Broker) -> anyhow::Result<usize> {
    let mut tx = pool.begin().await?;

    let locked: bool =
        sqlx::query_scalar("SELECT pg_try_advisory_xact_lock(hashtext('outbox_publisher'))")
            .fetch_one(&mut tx)
            .await?;
    if !locked {
        tx.rollback().await?;
        return Ok(0);
    }

    let rows = sqlx::query(
        r#"
        SELECT row_id, topic, msg_key, envelope
        FROM outbox
        WHERE published_at IS NULL
        ORDER BY row_id
        LIMIT $1
        "#,
    )
    .bind(*config::OUTBOX_BATCH_SIZE)
    .fetch_all(&mut tx)
    .await?;

    let mut published = 0usize;
    for row in rows {
        let row_id: i64 = row.get("row_id");
        let topic: String = row.get("topic");
        let key: String = row.get("msg_key");
        let body: Value = row.get("envelope");

        let envelope: EventEnvelope = match serde_json::from_value(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                // A row that cannot decode can never publish; park it rather
                // than wedging the queue behind it.
                warn!(row_id, ?err, "unreadable outbox row marked published");
                sqlx::query("UPDATE outbox SET published_at = NOW() WHERE row_id = $1")
                    .bind(row_id)
                    .execute(&mut tx)
                    .await?;
                continue;
            }
        };

        broker.publish(&topic, &key, &envelope).await?;
        sqlx::query("UPDATE outbox SET published_at = NOW() WHERE row_id = $1")
            .bind(row_id)
            .execute(&mut tx)
            .await?;
        published += 1;
    }

    tx.commit().await?;
    Ok(published)
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};

use crate::config;
use crate::envelope::EventEnvelope;
use crate::error::BrokerError;

/// One consumed message plus the coordinates needed to commit it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub partition_id: i32,
    pub log_offset: i64,
    pub group_id: String,
    pub consumer_id: String,
    pub envelope: EventEnvelope,
}

/// Transport contract the core programs against. Partition-ordered,
/// at-least-once; one outstanding delivery per `(group, partition)`.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        envelope: &EventEnvelope,
    ) -> Result<(), BrokerError>;

    /// Claims the next message from any subscribed partition, or None when
    /// the backlog is empty. The claim is leased: it returns to the pool if
    /// neither `ack` nor `release` lands before the lease expires.
    async fn fetch(
        &self,
        group_id: &str,
        topics: &[&str],
        consumer_id: &str,
    ) -> Result<Option<Delivery>, BrokerError>;

    /// Commits the offset and releases the partition. Only valid after the
    /// handler's state transaction is durable.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Releases the partition without committing, for clean redelivery.
    async fn release(&self, delivery: &Delivery) -> Result<(), BrokerError>;
}

/// Stable partition assignment: first eight bytes of sha256(key).
pub fn partition_for(key: &str, partitions: i32) -> i32 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % partitions.max(1) as u64) as i32
}

/// Postgres-backed broker: an append-only `event_log`, per-topic cursors in
/// `consumer_offsets`, and one lease per `(group, partition)` in
/// `partition_leases`. The lease spans every topic the group consumes, so a
/// partition — and with it every exception hashed to it — is handled by at
/// most one consumer of the group at a time, regardless of how many topics
/// the role subscribes to.
#[derive(Clone)]
pub struct PgBroker {
    pool: PgPool,
    partitions: i32,
    lease_seconds: i64,
}

impl PgBroker {
    pub fn new(pool: PgPool) -> Self {
        PgBroker {
            pool,
            partitions: *config::BROKER_PARTITIONS,
            lease_seconds: *config::BROKER_LEASE_SECONDS,
        }
    }

    pub fn with_partitions(pool: PgPool, partitions: i32, lease_seconds: i64) -> Self {
        PgBroker {
            pool,
            partitions,
            lease_seconds,
        }
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        envelope: &EventEnvelope,
    ) -> Result<(), BrokerError> {
        let body = serde_json::to_value(envelope)?;
        let partition_id = partition_for(key, self.partitions);
        sqlx::query(
            r#"
            INSERT INTO event_log (topic, partition_id, msg_key, envelope)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(topic)
        .bind(partition_id)
        .bind(key)
        .bind(&body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch(
        &self,
        group_id: &str,
        topics: &[&str],
        consumer_id: &str,
    ) -> Result<Option<Delivery>, BrokerError> {
        let topic_list: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        let mut tx = self.pool.begin().await?;

        // Cursor and lease rows are created lazily the first time a
        // partition carries traffic for this group.
        sqlx::query(
            r#"
            INSERT INTO consumer_offsets (group_id, topic, partition_id)
            SELECT DISTINCT $1, e.topic, e.partition_id
            FROM event_log e
            WHERE e.topic = ANY($2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(group_id)
        .bind(&topic_list)
        .execute(&mut tx)
        .await?;
        sqlx::query(
            r#"
            INSERT INTO partition_leases (group_id, partition_id)
            SELECT DISTINCT $1, e.partition_id
            FROM event_log e
            WHERE e.topic = ANY($2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(group_id)
        .bind(&topic_list)
        .execute(&mut tx)
        .await?;

        // Claim a whole partition for this group, across every subscribed
        // topic at once.
        let claim = sqlx::query(
            r#"
            SELECT pl.partition_id
            FROM partition_leases pl
            WHERE pl.group_id = $1
              AND (pl.lease_expires_at IS NULL OR pl.lease_expires_at < NOW())
              AND EXISTS (
                  SELECT 1
                  FROM event_log e
                  JOIN consumer_offsets co
                    ON co.group_id = $1
                   AND co.topic = e.topic
                   AND co.partition_id = e.partition_id
                  WHERE e.topic = ANY($2)
                    AND e.partition_id = pl.partition_id
                    AND e.id > co.committed_offset
              )
            ORDER BY pl.updated_at
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(group_id)
        .bind(&topic_list)
        .fetch_optional(&mut tx)
        .await?;

        let Some(claim) = claim else {
            tx.rollback().await?;
            return Ok(None);
        };
        let partition_id: i32 = claim.get("partition_id");

        sqlx::query(
            r#"
            UPDATE partition_leases
            SET claimed_by = $3,
                lease_expires_at = NOW() + ($4::BIGINT * INTERVAL '1 second'),
                updated_at = NOW()
            WHERE group_id = $1 AND partition_id = $2
            "#,
        )
        .bind(group_id)
        .bind(partition_id)
        .bind(consumer_id)
        .bind(self.lease_seconds)
        .execute(&mut tx)
        .await?;

        // Oldest unconsumed message in the partition, whichever subscribed
        // topic it sits on: log append order doubles as delivery order.
        let message = sqlx::query(
            r#"
            SELECT e.id, e.topic, e.envelope
            FROM event_log e
            JOIN consumer_offsets co
              ON co.group_id = $1
             AND co.topic = e.topic
             AND co.partition_id = e.partition_id
            WHERE e.topic = ANY($2)
              AND e.partition_id = $3
              AND e.id > co.committed_offset
            ORDER BY e.id
            LIMIT 1
            "#,
        )
        .bind(group_id)
        .bind(&topic_list)
        .bind(partition_id)
        .fetch_one(&mut tx)
        .await?;
        let log_offset: i64 = message.get("id");
        let topic: String = message.get("topic");
        let body: Value = message.get("envelope");
        let envelope: EventEnvelope = serde_json::from_value(body)?;

        tx.commit().await?;

        Ok(Some(Delivery {
            topic,
            partition_id,
            log_offset,
            group_id: group_id.to_string(),
            consumer_id: consumer_id.to_string(),
            envelope,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut tx = self.pool.begin().await?;

        // The offset commits only while this consumer still holds the
        // partition; a lapsed lease means the message is already being
        // redelivered elsewhere and this ack must not move the cursor.
        let released = sqlx::query(
            r#"
            UPDATE partition_leases
            SET claimed_by = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE group_id = $1 AND partition_id = $2
              AND claimed_by = $3
            "#,
        )
        .bind(&delivery.group_id)
        .bind(delivery.partition_id)
        .bind(&delivery.consumer_id)
        .execute(&mut tx)
        .await?;

        if released.rows_affected() == 1 {
            sqlx::query(
                r#"
                UPDATE consumer_offsets
                SET committed_offset = $4,
                    updated_at = NOW()
                WHERE group_id = $1 AND topic = $2 AND partition_id = $3
                  AND committed_offset < $4
                "#,
            )
            .bind(&delivery.group_id)
            .bind(&delivery.topic)
            .bind(delivery.partition_id)
            .bind(delivery.log_offset)
            .execute(&mut tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        sqlx::query(
            r#"
            UPDATE partition_leases
            SET claimed_by = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE group_id = $1 AND partition_id = $2
              AND claimed_by = $3
            "#,
        )
        .bind(&delivery.group_id)
        .bind(delivery.partition_id)
        .bind(&delivery.consumer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LoggedMessage {
    pub log_offset: i64,
    pub topic: String,
    pub msg_key: String,
    pub envelope: Value,
    pub appended_at: DateTime<Utc>,
}

/// Raw read of a topic, newest first. Used by the operator read surface for
/// the DLQ listing.
pub async fn read_topic(
    pool: &PgPool,
    topic: &str,
    limit: i64,
) -> Result<Vec<LoggedMessage>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, topic, msg_key, envelope, appended_at
        FROM event_log
        WHERE topic = $1
        ORDER BY id DESC
        LIMIT $2
        "#,
    )
    .bind(topic)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| LoggedMessage {
            log_offset: row.get("id"),
            topic: row.get("topic"),
            msg_key: row.get("msg_key"),
            envelope: row.get("envelope"),
            appended_at: row.get("appended_at"),
        })
        .collect())
}

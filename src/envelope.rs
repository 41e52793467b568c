use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::WorkerRole;

pub const ENVELOPE_SCHEMA_VERSION: i32 = 1;

/// Topic names carried on the event log. Keys are always `exception_id`.
pub mod topics {
    pub const EXCEPTIONS_INGESTED: &str = "exceptions.ingested";
    pub const EXCEPTIONS_NORMALIZED: &str = "exceptions.normalized";
    pub const TRIAGE_COMPLETED: &str = "triage.completed";
    pub const POLICY_COMPLETED: &str = "policy.completed";
    pub const POLICY_REQUESTED: &str = "policy.requested";
    pub const PLAYBOOK_MATCHED: &str = "playbook.matched";
    pub const STEP_REQUESTED: &str = "step.requested";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const TOOL_REQUESTED: &str = "tool.requested";
    pub const TOOL_COMPLETED: &str = "tool.completed";
    pub const PLAYBOOK_COMPLETED: &str = "playbook.completed";
    pub const FEEDBACK_CAPTURED: &str = "feedback.captured";
    pub const CONTROL_RETRY: &str = "control.retry";
    pub const CONTROL_DLQ: &str = "control.dlq";
    pub const SLA_IMMINENT: &str = "sla.imminent";
    pub const SLA_EXPIRED: &str = "sla.expired";
}

/// Topics each consuming role subscribes to, one consumer group per role.
pub fn topics_for_role(role: WorkerRole) -> &'static [&'static str] {
    match role {
        WorkerRole::Intake => &[topics::EXCEPTIONS_INGESTED],
        WorkerRole::Triage => &[topics::EXCEPTIONS_NORMALIZED],
        WorkerRole::Policy => &[
            topics::TRIAGE_COMPLETED,
            topics::POLICY_REQUESTED,
            topics::SLA_IMMINENT,
        ],
        WorkerRole::Playbook => &[topics::POLICY_COMPLETED],
        WorkerRole::Step => &[
            topics::PLAYBOOK_MATCHED,
            topics::STEP_REQUESTED,
            topics::STEP_COMPLETED,
            topics::TOOL_COMPLETED,
        ],
        WorkerRole::Tool => &[topics::TOOL_REQUESTED],
        WorkerRole::Feedback => &[topics::FEEDBACK_CAPTURED],
        WorkerRole::SlaMonitor | WorkerRole::Api => &[],
    }
}

mod rfc3339_millis {
    use super::*;
    use serde::{de, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(de)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(de::Error::custom)
    }
}

/// Wire-format wrapper used on every topic. Bit-stable across languages:
/// unknown fields survive a decode/encode round trip via the flattened
/// catch-all map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub schema_version: i32,
    pub event_id: Uuid,
    pub event_type: String,
    pub tenant_id: String,
    pub exception_id: Uuid,
    #[serde(with = "rfc3339_millis")]
    pub occurred_at: DateTime<Utc>,
    pub producer: String,
    pub correlation_id: String,
    pub attempt: i32,
    #[serde(default)]
    pub payload: Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl EventEnvelope {
    pub fn new(
        event_type: &str,
        tenant_id: &str,
        exception_id: Uuid,
        producer: &str,
        correlation_id: &str,
        payload: Value,
    ) -> Self {
        EventEnvelope {
            schema_version: ENVELOPE_SCHEMA_VERSION,
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            tenant_id: tenant_id.to_string(),
            exception_id,
            occurred_at: Utc::now(),
            producer: producer.to_string(),
            correlation_id: correlation_id.to_string(),
            attempt: 1,
            payload,
            extra: serde_json::Map::new(),
        }
    }

    /// Partition key: per-exception ordering is keyed by exception identity.
    pub fn partition_key(&self) -> String {
        self.exception_id.to_string()
    }

    /// Copy of this envelope with a fresh delivery attempt counter, used by
    /// the retry dispatcher when re-publishing to the original topic.
    pub fn with_attempt(&self, attempt: i32) -> Self {
        let mut next = self.clone();
        next.attempt = attempt;
        next
    }
}

/// Wire event types. Envelope `event_type` values; distinct from the
/// PascalCase timeline row types in `db::exception_events`.
pub mod event_types {
    pub const EXCEPTION_INGESTED: &str = "exception.ingested";
    pub const EXCEPTION_NORMALIZED: &str = "exception.normalized";
    pub const TRIAGE_COMPLETED: &str = "triage.completed";
    pub const POLICY_COMPLETED: &str = "policy.completed";
    pub const POLICY_REQUESTED: &str = "policy.requested";
    pub const PLAYBOOK_MATCHED: &str = "playbook.matched";
    pub const PLAYBOOK_COMPLETED: &str = "playbook.completed";
    pub const STEP_REQUESTED: &str = "step.requested";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const TOOL_REQUESTED: &str = "tool.requested";
    pub const TOOL_COMPLETED: &str = "tool.completed";
    pub const FEEDBACK_CAPTURED: &str = "feedback.captured";
    pub const RETRY_SCHEDULED: &str = "retry.scheduled";
    pub const DLQ_DIVERTED: &str = "dlq.diverted";
    pub const SLA_IMMINENT: &str = "sla.imminent";
    pub const SLA_EXPIRED: &str = "sla.expired";
}

/// Payload of a `retry.scheduled` wrapper on `control.retry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDirective {
    pub original_topic: String,
    #[serde(with = "rfc3339_millis")]
    pub not_before: DateTime<Utc>,
    pub error_kind: String,
    pub error: String,
    pub envelope: EventEnvelope,
}

/// Payload of a `dlq.diverted` wrapper on `control.dlq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqDiversion {
    pub original_topic: String,
    pub reason: String,
    pub error: String,
    pub envelope: EventEnvelope,
}

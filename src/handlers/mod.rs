pub mod feedback;
pub mod intake;
pub mod playbook_stage;
pub mod policy_stage;
pub mod step;
pub mod triage;

use serde_json::Value;
use uuid::Uuid;

use crate::config::WorkerRole;
use crate::db::exception_events::NewExceptionEvent;
use crate::db::exceptions::{ExceptionRow, ExceptionUpdate, PipelineStage, Severity};
use crate::db::playbook_progress::{PlaybookProgressRow, StepStatus};
use crate::envelope::EventEnvelope;
use crate::error::ProcessingError;
use crate::registry::ConfigSnapshot;

/// Envelope staged for the outbox as part of a handler commit.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: &'static str,
    pub envelope: EventEnvelope,
}

/// New aggregate produced by intake.
#[derive(Debug, Clone)]
pub struct CreateException {
    pub source_system: String,
    pub domain: String,
    pub exception_type: String,
    pub severity: Severity,
    pub raw_payload: Value,
    pub normalized_payload: Value,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SeededStep {
    pub step_order: i32,
    pub name: String,
    pub action_type: &'static str,
}

/// Playbook-progress mutations a handler may request.
#[derive(Debug, Clone)]
pub enum ProgressOp {
    SeedSteps {
        playbook_id: String,
        playbook_version: i32,
        steps: Vec<SeededStep>,
    },
    MarkInProgress {
        step_order: i32,
    },
    MarkTerminal {
        step_order: i32,
        status: StepStatus,
        notes: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct FeedbackWrite {
    pub verdict: String,
    pub rationale: Option<String>,
    pub actor_id: Option<String>,
}

/// Everything a role handler wants persisted and emitted, applied atomically
/// by `runtime::commit`: state delta (CAS on `expected_version`), timeline
/// rows, child-table writes, and outbound envelopes through the outbox.
#[derive(Debug, Default)]
pub struct HandlerOutcome {
    pub create: Option<CreateException>,
    pub update: Option<ExceptionUpdate>,
    pub expected_version: Option<i64>,
    pub events: Vec<NewExceptionEvent>,
    pub progress: Vec<ProgressOp>,
    pub feedback: Option<FeedbackWrite>,
    pub outbound: Vec<OutboundMessage>,
}

impl HandlerOutcome {
    pub fn is_empty(&self) -> bool {
        self.create.is_none()
            && self.update.is_none()
            && self.events.is_empty()
            && self.progress.is_empty()
            && self.feedback.is_none()
            && self.outbound.is_empty()
    }
}

/// Inputs shared by every role handler invocation. Pure data: resolving it
/// is the runtime's job, so the handlers themselves stay deterministic.
pub struct HandlerInput<'a> {
    pub state: Option<&'a ExceptionRow>,
    pub progress: &'a [PlaybookProgressRow],
    pub envelope: &'a EventEnvelope,
    pub snapshot: &'a ConfigSnapshot,
}

impl<'a> HandlerInput<'a> {
    /// The aggregate, or a stale classification when the pipeline reached
    /// this role without its create having landed.
    pub fn require_state(&self) -> Result<&'a ExceptionRow, ProcessingError> {
        self.state.ok_or_else(|| {
            ProcessingError::Permanent(format!(
                "no exception {} for tenant {}",
                self.envelope.exception_id, self.envelope.tenant_id
            ))
        })
    }

    /// Stage-ownership guard: events for a stage the exception already left
    /// are replays and must be acked without mutation.
    pub fn require_stage(
        &self,
        row: &ExceptionRow,
        expected: PipelineStage,
    ) -> Result<(), ProcessingError> {
        if row.current_stage == expected {
            return Ok(());
        }
        Err(ProcessingError::StalePrecondition(format!(
            "expected stage {} but exception {} is at {}",
            expected.as_str(),
            row.exception_id,
            row.current_stage.as_str()
        )))
    }
}

/// Routes one delivery to its role handler. Pure: `(state, event, config
/// snapshot) → (state delta, outbound events)`.
pub fn dispatch(role: WorkerRole, input: &HandlerInput<'_>) -> Result<HandlerOutcome, ProcessingError> {
    match role {
        WorkerRole::Intake => intake::handle(input),
        WorkerRole::Triage => triage::handle(input),
        WorkerRole::Policy => policy_stage::handle(input),
        WorkerRole::Playbook => playbook_stage::handle(input),
        WorkerRole::Step => step::handle(input),
        WorkerRole::Feedback => feedback::handle(input),
        WorkerRole::Tool | WorkerRole::SlaMonitor | WorkerRole::Api => Err(
            ProcessingError::Permanent(format!("role {role} has no pure handler")),
        ),
    }
}

/// Producer-side helper: envelope for the same exception, carrying the
/// inbound correlation id forward.
pub fn outbound_envelope(
    source: &EventEnvelope,
    event_type: &str,
    producer: WorkerRole,
    payload: Value,
) -> EventEnvelope {
    EventEnvelope::new(
        event_type,
        &source.tenant_id,
        source.exception_id,
        producer.as_str(),
        &source.correlation_id,
        payload,
    )
}

/// Typed view of a `step.requested` / `step.completed` / `tool.completed`
/// payload field.
pub fn payload_i32(payload: &Value, field: &str) -> Result<i32, ProcessingError> {
    payload
        .get(field)
        .and_then(Value::as_i64)
        .map(|v| v as i32)
        .ok_or_else(|| ProcessingError::Permanent(format!("payload missing integer `{field}`")))
}

pub fn payload_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str, ProcessingError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ProcessingError::Permanent(format!("payload missing string `{field}`")))
}

pub fn payload_uuid(payload: &Value, field: &str) -> Result<Uuid, ProcessingError> {
    payload_str(payload, field)?
        .parse()
        .map_err(|_| ProcessingError::Permanent(format!("payload field `{field}` is not a uuid")))
}

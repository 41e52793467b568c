use serde_json::{json, Value};

use crate::config::WorkerRole;
use crate::db::exception_events::{timeline, ActorType, NewExceptionEvent};
use crate::db::exceptions::{ExceptionStatus, ExceptionUpdate, PipelineStage};
use crate::envelope::{event_types, topics};
use crate::error::ProcessingError;
use crate::handlers::{
    outbound_envelope, payload_str, FeedbackWrite, HandlerInput, HandlerOutcome, OutboundMessage,
};

/// Feedback: persists the operator's verdict on resolution quality. A
/// confirmed resolution closes the exception; a disputed one reopens the
/// policy stage when the exception can still move.
pub fn handle(input: &HandlerInput<'_>) -> Result<HandlerOutcome, ProcessingError> {
    let row = input.require_state()?;
    let verdict = payload_str(&input.envelope.payload, "verdict")?;
    if verdict != "correct" && verdict != "incorrect" {
        return Err(ProcessingError::Permanent(format!(
            "unknown feedback verdict `{verdict}`"
        )));
    }
    let rationale = input
        .envelope
        .payload
        .get("rationale")
        .and_then(Value::as_str)
        .map(str::to_string);
    let actor_id = input
        .envelope
        .payload
        .get("actor_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    let trigger = input.envelope.event_id.to_string();
    let mut outcome = HandlerOutcome {
        expected_version: Some(row.version),
        feedback: Some(FeedbackWrite {
            verdict: verdict.to_string(),
            rationale: rationale.clone(),
            actor_id: actor_id.clone(),
        }),
        ..HandlerOutcome::default()
    };
    outcome.events.push(
        NewExceptionEvent::scoped(
            timeline::FEEDBACK_CAPTURED,
            WorkerRole::Feedback.as_str(),
            input.envelope.attempt,
            &trigger,
            json!({ "verdict": verdict, "rationale": rationale }),
        )
        .with_actor(ActorType::User, actor_id),
    );

    if verdict == "correct" && row.status == ExceptionStatus::Resolved {
        outcome.update = Some(ExceptionUpdate {
            status: Some(ExceptionStatus::Closed),
            current_stage: Some(PipelineStage::Terminal),
            ..ExceptionUpdate::default()
        });
        outcome.events.push(NewExceptionEvent::scoped(
            timeline::EXCEPTION_CLOSED,
            WorkerRole::Feedback.as_str(),
            input.envelope.attempt,
            &trigger,
            json!({ "reason": "feedback_confirmed" }),
        ));
    } else if verdict == "incorrect" && !row.status.is_terminal() {
        outcome.outbound.push(OutboundMessage {
            topic: topics::POLICY_REQUESTED,
            envelope: outbound_envelope(
                input.envelope,
                event_types::POLICY_REQUESTED,
                WorkerRole::Feedback,
                json!({ "reason": "feedback_incorrect" }),
            ),
        });
    }

    Ok(outcome)
}

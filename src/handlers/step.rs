use serde_json::{json, Value};

use crate::config::WorkerRole;
use crate::db::exception_events::{timeline, ActorType, NewExceptionEvent};
use crate::db::exceptions::{ExceptionRow, ExceptionStatus, ExceptionUpdate, PipelineStage};
use crate::db::playbook_progress::{PlaybookProgressRow, StepStatus};
use crate::envelope::{event_types, topics};
use crate::error::ProcessingError;
use crate::handlers::{
    outbound_envelope, payload_i32, payload_str, HandlerInput, HandlerOutcome, OutboundMessage,
    ProgressOp,
};
use crate::policy::{build_facts, Condition};
use crate::registry::{ActionType, FailurePolicy, PlaybookDef, StepDef};

/// Step: advances playbook progress one step at a time. Tool steps fan out
/// to the tool role; human steps park until an operator acknowledgement;
/// decision steps branch on a pack condition.
pub fn handle(input: &HandlerInput<'_>) -> Result<HandlerOutcome, ProcessingError> {
    let row = input.require_state()?;
    match input.envelope.event_type.as_str() {
        // The match notification is informational; progress was seeded in
        // the same commit that published it.
        event_types::PLAYBOOK_MATCHED => Ok(HandlerOutcome::default()),
        event_types::STEP_REQUESTED => on_step_requested(input, row),
        event_types::TOOL_COMPLETED => on_tool_completed(input, row),
        event_types::STEP_COMPLETED => on_operator_ack(input, row),
        other => Err(ProcessingError::Permanent(format!(
            "step role cannot handle event type {other}"
        ))),
    }
}

fn playbook_for<'a>(
    input: &HandlerInput<'a>,
    row: &ExceptionRow,
) -> Result<&'a PlaybookDef, ProcessingError> {
    let playbook_id = row.current_playbook_id.as_deref().ok_or_else(|| {
        ProcessingError::StalePrecondition(format!(
            "exception {} has no playbook in flight",
            row.exception_id
        ))
    })?;
    let version = row.current_playbook_version.ok_or_else(|| {
        ProcessingError::Permanent("playbook id without version on exception".into())
    })?;
    input
        .snapshot
        .playbook_catalog
        .get(playbook_id, version)
        .ok_or_else(|| {
            ProcessingError::ConfigMissing(format!(
                "playbook {playbook_id} v{version} absent from catalog"
            ))
        })
}

/// Stage/cursor guard shared by every step-role message.
fn require_cursor(
    input: &HandlerInput<'_>,
    row: &ExceptionRow,
    step_order: i32,
) -> Result<(), ProcessingError> {
    input.require_stage(row, PipelineStage::Step)?;
    if row.current_step != Some(step_order) {
        return Err(ProcessingError::StalePrecondition(format!(
            "step {step_order} is not the current step ({:?}) of exception {}",
            row.current_step, row.exception_id
        )));
    }
    Ok(())
}

fn progress_for<'a>(
    input: &HandlerInput<'a>,
    step_order: i32,
) -> Result<&'a PlaybookProgressRow, ProcessingError> {
    input
        .progress
        .iter()
        .find(|p| p.step_order == step_order)
        .ok_or_else(|| {
            ProcessingError::Permanent(format!("no progress row for step {step_order}"))
        })
}

fn on_step_requested(
    input: &HandlerInput<'_>,
    row: &ExceptionRow,
) -> Result<HandlerOutcome, ProcessingError> {
    let step_order = payload_i32(&input.envelope.payload, "step_order")?;
    require_cursor(input, row, step_order)?;
    let playbook = playbook_for(input, row)?;
    let progress = progress_for(input, step_order)?;

    if progress.status.is_terminal() {
        return Err(ProcessingError::StalePrecondition(format!(
            "step {step_order} already reached {:?}",
            progress.status
        )));
    }
    if step_order > 1 {
        let previous = progress_for(input, step_order - 1)?;
        if !previous.status.unblocks_next() {
            return Err(ProcessingError::StalePrecondition(format!(
                "step {} has not completed; step {step_order} may not start",
                step_order - 1
            )));
        }
    }

    let step = playbook.step(step_order).ok_or_else(|| {
        ProcessingError::Permanent(format!(
            "playbook {} v{} has no step {step_order}",
            playbook.playbook_id, playbook.version
        ))
    })?;

    if progress.status == StepStatus::InProgress {
        // Redelivered request for a step that already dispatched. A human
        // step is simply still waiting; anything else must not run twice.
        return match step.action_type {
            ActionType::Human => Ok(HandlerOutcome::default()),
            _ => Err(ProcessingError::StalePrecondition(format!(
                "step {step_order} was already dispatched"
            ))),
        };
    }

    match step.action_type {
        ActionType::Tool => dispatch_tool(input, row, step, progress.attempts + 1),
        ActionType::Human => {
            let mut outcome = HandlerOutcome {
                expected_version: Some(row.version),
                ..HandlerOutcome::default()
            };
            outcome.progress.push(ProgressOp::MarkInProgress { step_order });
            Ok(outcome)
        }
        ActionType::Decision => decide(input, row, playbook, step),
    }
}

fn dispatch_tool(
    input: &HandlerInput<'_>,
    row: &ExceptionRow,
    step: &StepDef,
    execution_attempt: i32,
) -> Result<HandlerOutcome, ProcessingError> {
    let tool_id = step
        .action_config
        .get("tool_id")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ProcessingError::Permanent(format!("tool step `{}` declares no tool_id", step.name))
        })?;
    let executor = step
        .action_config
        .get("executor")
        .and_then(Value::as_str)
        .unwrap_or("simulated");

    let mut outcome = HandlerOutcome {
        expected_version: Some(row.version),
        ..HandlerOutcome::default()
    };
    outcome.progress.push(ProgressOp::MarkInProgress {
        step_order: step.step_order,
    });
    outcome.events.push(NewExceptionEvent::step_scoped(
        timeline::TOOL_REQUESTED,
        WorkerRole::Step.as_str(),
        execution_attempt,
        step.step_order,
        json!({ "tool_id": tool_id, "execution_attempt": execution_attempt }),
    ));
    outcome.outbound.push(OutboundMessage {
        topic: topics::TOOL_REQUESTED,
        envelope: outbound_envelope(
            input.envelope,
            event_types::TOOL_REQUESTED,
            WorkerRole::Step,
            json!({
                "step_order": step.step_order,
                "tool_id": tool_id,
                "executor": executor,
                "action_config": step.action_config,
                "input_payload": row.normalized_payload.clone().unwrap_or(json!({})),
                "execution_attempt": execution_attempt,
            }),
        ),
    });
    Ok(outcome)
}

fn decide(
    input: &HandlerInput<'_>,
    row: &ExceptionRow,
    playbook: &PlaybookDef,
    step: &StepDef,
) -> Result<HandlerOutcome, ProcessingError> {
    let condition: Condition = serde_json::from_value(
        step.action_config
            .get("when")
            .cloned()
            .ok_or_else(|| {
                ProcessingError::Permanent(format!(
                    "decision step `{}` declares no condition",
                    step.name
                ))
            })?,
    )
    .map_err(|err| ProcessingError::Permanent(format!("invalid decision condition: {err}")))?;

    let facts = build_facts(row);
    if condition.eval(&facts) {
        complete_step(input, row, playbook, step.step_order, StepStatus::Completed, None, ActorType::Agent, None)
    } else {
        let on_false = step
            .action_config
            .get("on_false")
            .and_then(Value::as_str)
            .unwrap_or("skip");
        match on_false {
            "escalate" => escalate_step(
                input,
                row,
                step.step_order,
                "decision condition evaluated false",
            ),
            _ => complete_step(
                input,
                row,
                playbook,
                step.step_order,
                StepStatus::Skipped,
                Some("decision condition evaluated false".into()),
                ActorType::Agent,
                None,
            ),
        }
    }
}

fn on_tool_completed(
    input: &HandlerInput<'_>,
    row: &ExceptionRow,
) -> Result<HandlerOutcome, ProcessingError> {
    let step_order = payload_i32(&input.envelope.payload, "step_order")?;
    require_cursor(input, row, step_order)?;
    let playbook = playbook_for(input, row)?;
    let progress = progress_for(input, step_order)?;
    if progress.status.is_terminal() {
        return Err(ProcessingError::StalePrecondition(format!(
            "step {step_order} already reached {:?}",
            progress.status
        )));
    }

    let success = input
        .envelope
        .payload
        .get("success")
        .and_then(Value::as_bool)
        .ok_or_else(|| ProcessingError::Permanent("tool completion missing `success`".into()))?;

    if success {
        let execution_id = input.envelope.payload.get("execution_id").cloned();
        complete_step(
            input,
            row,
            playbook,
            step_order,
            StepStatus::Completed,
            execution_id.and_then(|v| v.as_str().map(|s| format!("tool execution {s}"))),
            ActorType::Agent,
            None,
        )
    } else {
        let error = input
            .envelope
            .payload
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("tool reported failure")
            .to_string();
        apply_failure_policy(input, row, playbook, step_order, progress, &error)
    }
}

fn on_operator_ack(
    input: &HandlerInput<'_>,
    row: &ExceptionRow,
) -> Result<HandlerOutcome, ProcessingError> {
    let step_order = payload_i32(&input.envelope.payload, "step_order")?;
    require_cursor(input, row, step_order)?;
    let playbook = playbook_for(input, row)?;
    let progress = progress_for(input, step_order)?;
    if progress.status.is_terminal() {
        return Err(ProcessingError::StalePrecondition(format!(
            "step {step_order} already reached {:?}",
            progress.status
        )));
    }

    let ack_outcome = payload_str(&input.envelope.payload, "outcome")?;
    let notes = input
        .envelope
        .payload
        .get("notes")
        .and_then(Value::as_str)
        .map(str::to_string);
    let actor_id = input
        .envelope
        .payload
        .get("actor_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    match ack_outcome {
        "success" => complete_step(
            input,
            row,
            playbook,
            step_order,
            StepStatus::Completed,
            notes,
            ActorType::User,
            actor_id,
        ),
        "skipped" => complete_step(
            input,
            row,
            playbook,
            step_order,
            StepStatus::Skipped,
            notes,
            ActorType::User,
            actor_id,
        ),
        "failed" => {
            let error = notes.unwrap_or_else(|| "operator reported failure".to_string());
            apply_failure_policy(input, row, playbook, step_order, progress, &error)
        }
        other => Err(ProcessingError::Permanent(format!(
            "unknown step outcome `{other}`"
        ))),
    }
}

fn apply_failure_policy(
    input: &HandlerInput<'_>,
    row: &ExceptionRow,
    playbook: &PlaybookDef,
    step_order: i32,
    progress: &PlaybookProgressRow,
    error: &str,
) -> Result<HandlerOutcome, ProcessingError> {
    let step = playbook.step(step_order).ok_or_else(|| {
        ProcessingError::Permanent(format!(
            "playbook {} v{} has no step {step_order}",
            playbook.playbook_id, playbook.version
        ))
    })?;

    match &step.failure_policy {
        FailurePolicy::Retry { max_attempts } => {
            if progress.attempts < *max_attempts {
                match step.action_type {
                    ActionType::Tool => dispatch_tool(input, row, step, progress.attempts + 1),
                    _ => {
                        // Human retry re-arms the step and waits for the next
                        // acknowledgement.
                        let mut outcome = HandlerOutcome {
                            expected_version: Some(row.version),
                            ..HandlerOutcome::default()
                        };
                        outcome.progress.push(ProgressOp::MarkInProgress { step_order });
                        Ok(outcome)
                    }
                }
            } else {
                escalate_step(input, row, step_order, &format!("{error} (retries exhausted)"))
            }
        }
        FailurePolicy::Skip => complete_step(
            input,
            row,
            playbook,
            step_order,
            StepStatus::Skipped,
            Some(error.to_string()),
            ActorType::Agent,
            None,
        ),
        FailurePolicy::Escalate => escalate_step(input, row, step_order, error),
    }
}

#[allow(clippy::too_many_arguments)]
fn complete_step(
    input: &HandlerInput<'_>,
    row: &ExceptionRow,
    playbook: &PlaybookDef,
    step_order: i32,
    final_status: StepStatus,
    notes: Option<String>,
    actor_type: ActorType,
    actor_id: Option<String>,
) -> Result<HandlerOutcome, ProcessingError> {
    let producer = WorkerRole::Step.as_str();
    let attempt = input.envelope.attempt;

    let mut outcome = HandlerOutcome {
        expected_version: Some(row.version),
        ..HandlerOutcome::default()
    };
    outcome.progress.push(ProgressOp::MarkTerminal {
        step_order,
        status: final_status,
        notes: notes.clone(),
    });

    let event_type = if final_status == StepStatus::Skipped {
        timeline::STEP_SKIPPED
    } else {
        timeline::STEP_COMPLETED
    };
    outcome.events.push(
        NewExceptionEvent::step_scoped(
            event_type,
            producer,
            attempt,
            step_order,
            json!({ "step_order": step_order, "status": final_status, "notes": notes }),
        )
        .with_actor(actor_type, actor_id),
    );

    let next = step_order + 1;
    if next <= playbook.total_steps() {
        outcome.update = Some(ExceptionUpdate {
            current_step: Some(next),
            ..ExceptionUpdate::default()
        });
        outcome.events.push(NewExceptionEvent::step_scoped(
            timeline::STEP_REQUESTED,
            producer,
            attempt,
            next,
            json!({ "step_order": next }),
        ));
        outcome.outbound.push(OutboundMessage {
            topic: topics::STEP_REQUESTED,
            envelope: outbound_envelope(
                input.envelope,
                event_types::STEP_REQUESTED,
                WorkerRole::Step,
                json!({ "step_order": next }),
            ),
        });
    } else {
        outcome.update = Some(ExceptionUpdate {
            status: Some(ExceptionStatus::Resolved),
            current_stage: Some(PipelineStage::Feedback),
            ..ExceptionUpdate::default()
        });
        outcome.events.push(NewExceptionEvent::system(
            timeline::PLAYBOOK_COMPLETED,
            producer,
            attempt,
            json!({
                "playbook_id": playbook.playbook_id,
                "playbook_version": playbook.version,
                "total_steps": playbook.total_steps(),
            }),
        ));
        outcome.outbound.push(OutboundMessage {
            topic: topics::PLAYBOOK_COMPLETED,
            envelope: outbound_envelope(
                input.envelope,
                event_types::PLAYBOOK_COMPLETED,
                WorkerRole::Step,
                json!({
                    "playbook_id": playbook.playbook_id,
                    "playbook_version": playbook.version,
                }),
            ),
        });
    }

    Ok(outcome)
}

fn escalate_step(
    input: &HandlerInput<'_>,
    row: &ExceptionRow,
    step_order: i32,
    error: &str,
) -> Result<HandlerOutcome, ProcessingError> {
    let mut outcome = HandlerOutcome {
        expected_version: Some(row.version),
        ..HandlerOutcome::default()
    };
    outcome.progress.push(ProgressOp::MarkTerminal {
        step_order,
        status: StepStatus::Failed,
        notes: Some(error.to_string()),
    });
    outcome.update = Some(ExceptionUpdate {
        status: Some(ExceptionStatus::Escalated),
        current_stage: Some(PipelineStage::Terminal),
        ..ExceptionUpdate::default()
    });
    outcome.events.push(NewExceptionEvent::step_scoped(
        timeline::EXCEPTION_ESCALATED,
        WorkerRole::Step.as_str(),
        input.envelope.attempt,
        step_order,
        json!({ "reason": "step_failure", "step_order": step_order, "error": error }),
    ));
    Ok(outcome)
}

use serde_json::{json, Value};

use crate::config::WorkerRole;
use crate::db::exception_events::{timeline, NewExceptionEvent};
use crate::db::exceptions::{ExceptionStatus, ExceptionUpdate, PipelineStage};
use crate::envelope::{event_types, topics};
use crate::error::ProcessingError;
use crate::handlers::{
    outbound_envelope, HandlerInput, HandlerOutcome, OutboundMessage, ProgressOp, SeededStep,
};
use crate::playbook::select_playbook;

/// Playbook: ranks the policy's candidate set, materializes progress for the
/// winner, and requests its first step. No candidate above the threshold is
/// an escalation.
pub fn handle(input: &HandlerInput<'_>) -> Result<HandlerOutcome, ProcessingError> {
    let row = input.require_state()?;
    input.require_stage(row, PipelineStage::Playbook)?;

    let producer = WorkerRole::Playbook.as_str();
    let attempt = input.envelope.attempt;
    let trigger = input.envelope.event_id.to_string();

    let candidates: Vec<String> = input
        .envelope
        .payload
        .get("candidate_playbooks")
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let tags = input
        .snapshot
        .domain_pack
        .exception_types
        .get(&row.exception_type)
        .map(|def| def.tags.clone())
        .unwrap_or_default();

    let selection = select_playbook(
        &input.snapshot.playbook_catalog,
        &candidates,
        &row.exception_type,
        row.severity,
        &tags,
        &input.snapshot.policy_pack.ranking,
    );

    let mut outcome = HandlerOutcome {
        expected_version: Some(row.version),
        ..HandlerOutcome::default()
    };

    let Some(selection) = selection else {
        let mut update = ExceptionUpdate {
            current_stage: Some(PipelineStage::Terminal),
            ..ExceptionUpdate::default()
        };
        if row.status != ExceptionStatus::Escalated {
            update.status = Some(ExceptionStatus::Escalated);
        }
        outcome.update = Some(update);
        outcome.events.push(NewExceptionEvent::scoped(
            timeline::EXCEPTION_ESCALATED,
            producer,
            attempt,
            &trigger,
            json!({
                "reason": "no_playbook_above_threshold",
                "candidates": candidates,
            }),
        ));
        return Ok(outcome);
    };

    let playbook = selection.playbook;
    outcome.update = Some(ExceptionUpdate {
        status: Some(ExceptionStatus::InProgress),
        current_stage: Some(PipelineStage::Step),
        current_playbook_id: Some(playbook.playbook_id.clone()),
        current_playbook_version: Some(playbook.version),
        current_step: Some(1),
        ..ExceptionUpdate::default()
    });

    outcome.progress.push(ProgressOp::SeedSteps {
        playbook_id: playbook.playbook_id.clone(),
        playbook_version: playbook.version,
        steps: playbook
            .steps
            .iter()
            .map(|step| SeededStep {
                step_order: step.step_order,
                name: step.name.clone(),
                action_type: step.action_type.as_str(),
            })
            .collect(),
    });

    outcome.events.push(NewExceptionEvent::scoped(
        timeline::PLAYBOOK_MATCHED,
        producer,
        attempt,
        &trigger,
        json!({
            "playbook_id": playbook.playbook_id,
            "playbook_version": playbook.version,
            "score": selection.score,
            "total_steps": playbook.total_steps(),
        }),
    ));
    outcome.events.push(NewExceptionEvent::step_scoped(
        timeline::STEP_REQUESTED,
        producer,
        attempt,
        1,
        json!({ "step_order": 1 }),
    ));

    outcome.outbound.push(OutboundMessage {
        topic: topics::PLAYBOOK_MATCHED,
        envelope: outbound_envelope(
            input.envelope,
            event_types::PLAYBOOK_MATCHED,
            WorkerRole::Playbook,
            json!({
                "playbook_id": playbook.playbook_id,
                "playbook_version": playbook.version,
            }),
        ),
    });
    outcome.outbound.push(OutboundMessage {
        topic: topics::STEP_REQUESTED,
        envelope: outbound_envelope(
            input.envelope,
            event_types::STEP_REQUESTED,
            WorkerRole::Playbook,
            json!({ "step_order": 1 }),
        ),
    });

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventEnvelope;
    use crate::handlers::triage::tests::row;
    use crate::registry::ConfigSnapshot;

    fn snapshot() -> ConfigSnapshot {
        let mut snapshot = crate::handlers::triage::tests::snapshot();
        snapshot.playbook_catalog = serde_json::from_value(json!({
            "playbooks": [
                {"playbook_id": "PB_SETTLE", "version": 3, "name": "settlement repair",
                 "match": {"exception_types": ["SETTLEMENT_FAIL"], "min_severity": "MEDIUM"},
                 "steps": [
                    {"step_order": 1, "name": "verify", "action_type": "tool",
                     "action_config": {"tool_id": "ssi-verify"}},
                    {"step_order": 2, "name": "confirm", "action_type": "human"}
                 ]}
            ]
        }))
        .unwrap();
        snapshot
    }

    fn completed(candidates: serde_json::Value) -> EventEnvelope {
        EventEnvelope::new(
            event_types::POLICY_COMPLETED,
            "T1",
            uuid::Uuid::new_v4(),
            "policy",
            "corr-1",
            json!({ "candidate_playbooks": candidates }),
        )
    }

    #[test]
    fn winner_seeds_progress_and_requests_first_step() {
        let row = row(PipelineStage::Playbook);
        let snapshot = snapshot();
        let envelope = completed(json!(["PB_SETTLE"]));
        let outcome = handle(&HandlerInput {
            state: Some(&row),
            progress: &[],
            envelope: &envelope,
            snapshot: &snapshot,
        })
        .unwrap();

        let update = outcome.update.unwrap();
        assert_eq!(update.status, Some(ExceptionStatus::InProgress));
        assert_eq!(update.current_step, Some(1));
        assert_eq!(update.current_playbook_id.as_deref(), Some("PB_SETTLE"));
        assert!(matches!(
            outcome.progress.as_slice(),
            [ProgressOp::SeedSteps { steps, .. }] if steps.len() == 2
        ));
        let topics_emitted: Vec<_> = outcome.outbound.iter().map(|m| m.topic).collect();
        assert_eq!(
            topics_emitted,
            vec![topics::PLAYBOOK_MATCHED, topics::STEP_REQUESTED]
        );
    }

    #[test]
    fn empty_candidate_set_escalates() {
        let row = row(PipelineStage::Playbook);
        let snapshot = snapshot();
        let envelope = completed(json!([]));
        let outcome = handle(&HandlerInput {
            state: Some(&row),
            progress: &[],
            envelope: &envelope,
            snapshot: &snapshot,
        })
        .unwrap();
        assert_eq!(
            outcome.update.unwrap().status,
            Some(ExceptionStatus::Escalated)
        );
        assert!(outcome.outbound.is_empty());
    }
}

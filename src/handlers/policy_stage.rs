use serde_json::json;

use crate::config::WorkerRole;
use crate::db::exception_events::{timeline, NewExceptionEvent};
use crate::db::exceptions::{ExceptionStatus, ExceptionUpdate, PipelineStage};
use crate::envelope::{event_types, topics};
use crate::error::ProcessingError;
use crate::handlers::{outbound_envelope, HandlerInput, HandlerOutcome, OutboundMessage};
use crate::policy;

/// Policy: deterministic evaluation of the tenant policy pack against the
/// triaged exception. May override severity once, demand approvals, escalate,
/// reject, or nominate playbook candidates.
pub fn handle(input: &HandlerInput<'_>) -> Result<HandlerOutcome, ProcessingError> {
    let row = input.require_state()?;
    let producer = WorkerRole::Policy.as_str();
    let attempt = input.envelope.attempt;
    let trigger = input.envelope.event_id.to_string();

    let reopen = match input.envelope.event_type.as_str() {
        event_types::SLA_IMMINENT => {
            // The monitor already recorded the timeline row alongside its
            // emission; the policy group consumes the topic so operator
            // escalations can hook in, and simply acknowledges here.
            return Ok(HandlerOutcome::default());
        }
        event_types::POLICY_REQUESTED => {
            if row.status.is_terminal() {
                return Err(ProcessingError::StalePrecondition(format!(
                    "exception {} is terminal; policy re-evaluation refused",
                    row.exception_id
                )));
            }
            true
        }
        _ => {
            input.require_stage(row, PipelineStage::Policy)?;
            false
        }
    };

    // A reopen from ESCALATED passes back through OPEN before any further
    // transition; everything else evaluates from where it stands.
    let effective_status = if reopen && row.status == ExceptionStatus::Escalated {
        ExceptionStatus::Open
    } else {
        row.status
    };

    let facts = policy::build_facts(row);
    let decision = policy::evaluate(
        &input.snapshot.policy_pack,
        &facts,
        !row.severity_overridden,
    );

    let mut update = ExceptionUpdate::default();
    let mut outcome = HandlerOutcome::default();

    if reopen {
        outcome.events.push(NewExceptionEvent::scoped(
            timeline::POLICY_REOPENED,
            producer,
            attempt,
            &trigger,
            json!({ "reason": input.envelope.payload.get("reason") }),
        ));
    }

    let mut severity = row.severity;
    if let Some(override_to) = decision.severity_override {
        if override_to != row.severity {
            update.severity = Some(override_to);
            update.severity_overridden = Some(true);
            severity = override_to;
            outcome.events.push(NewExceptionEvent::scoped(
                timeline::SEVERITY_OVERRIDDEN,
                producer,
                attempt,
                &trigger,
                json!({
                    "from": row.severity,
                    "to": override_to,
                    "rules": decision.matched_rules,
                }),
            ));
        }
    }

    if decision.required_approvals != row.required_approvals {
        update.required_approvals = Some(decision.required_approvals);
    }

    outcome.events.push(NewExceptionEvent::scoped(
        timeline::POLICY_COMPLETED,
        producer,
        attempt,
        &trigger,
        json!({
            "severity": severity,
            "required_approvals": decision.required_approvals,
            "escalate": decision.escalate,
            "reject": decision.reject,
            "candidate_playbooks": decision.candidate_playbooks,
            "matched_rules": decision.matched_rules,
            "config_version": input.snapshot.version,
        }),
    ));

    if decision.reject {
        require_transition(effective_status, ExceptionStatus::Closed)?;
        update.status = Some(ExceptionStatus::Closed);
        update.current_stage = Some(PipelineStage::Terminal);
        outcome.events.push(NewExceptionEvent::scoped(
            timeline::EXCEPTION_CLOSED,
            producer,
            attempt,
            &trigger,
            json!({ "reason": "policy_reject", "rules": decision.matched_rules }),
        ));
    } else if decision.escalate {
        if effective_status != ExceptionStatus::Escalated {
            require_transition(effective_status, ExceptionStatus::Escalated)?;
            update.status = Some(ExceptionStatus::Escalated);
        }
        update.current_stage = Some(PipelineStage::Terminal);
        outcome.events.push(NewExceptionEvent::scoped(
            timeline::EXCEPTION_ESCALATED,
            producer,
            attempt,
            &trigger,
            json!({ "reason": "policy_escalate", "rules": decision.matched_rules }),
        ));
    } else if decision.required_approvals > 0 {
        if effective_status != ExceptionStatus::PendingApproval {
            require_transition(effective_status, ExceptionStatus::PendingApproval)?;
            update.status = Some(ExceptionStatus::PendingApproval);
        }
        // Stays parked at the policy stage until an operator recalculation
        // releases it.
        update.current_stage = Some(PipelineStage::Policy);
    } else {
        if effective_status != row.status {
            require_transition(row.status, effective_status)?;
            update.status = Some(effective_status);
        }
        update.current_stage = Some(PipelineStage::Playbook);
        outcome.outbound.push(OutboundMessage {
            topic: topics::POLICY_COMPLETED,
            envelope: outbound_envelope(
                input.envelope,
                event_types::POLICY_COMPLETED,
                WorkerRole::Policy,
                json!({
                    "severity": severity,
                    "required_approvals": decision.required_approvals,
                    "candidate_playbooks": decision.candidate_playbooks,
                }),
            ),
        });
    }

    outcome.update = Some(update);
    outcome.expected_version = Some(row.version);
    Ok(outcome)
}

fn require_transition(
    from: ExceptionStatus,
    to: ExceptionStatus,
) -> Result<(), ProcessingError> {
    if from == to || from.can_transition_to(to) {
        Ok(())
    } else {
        Err(ProcessingError::Permanent(format!(
            "illegal status transition {from:?} -> {to:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::exceptions::Severity;
    use crate::envelope::EventEnvelope;
    use crate::error::ErrorKind;
    use crate::handlers::triage::tests::row;
    use crate::registry::ConfigSnapshot;

    fn snapshot_with_rules(rules: serde_json::Value) -> ConfigSnapshot {
        let mut snapshot = crate::handlers::triage::tests::snapshot();
        snapshot.policy_pack = serde_json::from_value(json!({ "rules": rules })).unwrap();
        snapshot
    }

    fn triaged(event_type: &str) -> EventEnvelope {
        EventEnvelope::new(
            event_type,
            "T1",
            uuid::Uuid::new_v4(),
            "triage",
            "corr-1",
            json!({}),
        )
    }

    #[test]
    fn candidates_flow_to_playbook_stage() {
        let mut row = row(PipelineStage::Policy);
        row.normalized_payload = Some(json!({"amount": 1000, "features": {}}));
        let snapshot = snapshot_with_rules(json!([
            {"name": "settle", "when": {"op": "exists", "field": "payload.amount"},
             "then": {"candidate_playbooks": ["PB_SETTLE"]}}
        ]));
        let envelope = triaged(event_types::TRIAGE_COMPLETED);
        let outcome = handle(&HandlerInput {
            state: Some(&row),
            progress: &[],
            envelope: &envelope,
            snapshot: &snapshot,
        })
        .unwrap();
        assert_eq!(
            outcome.update.as_ref().unwrap().current_stage,
            Some(PipelineStage::Playbook)
        );
        assert_eq!(outcome.outbound.len(), 1);
        assert_eq!(outcome.outbound[0].topic, topics::POLICY_COMPLETED);
    }

    #[test]
    fn escalation_blocks_playbook_emission() {
        let mut row = row(PipelineStage::Policy);
        row.normalized_payload = Some(json!({"amount": 5_000_000, "features": {}}));
        let snapshot = snapshot_with_rules(json!([
            {"name": "big-break", "when": {"op": "gt", "field": "payload.amount", "value": 1_000_000},
             "then": {"escalate": true}}
        ]));
        let envelope = triaged(event_types::TRIAGE_COMPLETED);
        let outcome = handle(&HandlerInput {
            state: Some(&row),
            progress: &[],
            envelope: &envelope,
            snapshot: &snapshot,
        })
        .unwrap();
        let update = outcome.update.unwrap();
        assert_eq!(update.status, Some(ExceptionStatus::Escalated));
        assert!(outcome.outbound.is_empty());
    }

    #[test]
    fn severity_override_happens_at_most_once() {
        let mut row = row(PipelineStage::Policy);
        row.severity = Severity::Medium;
        row.severity_overridden = true;
        let snapshot = snapshot_with_rules(json!([
            {"name": "bump", "when": {"op": "exists", "field": "payload.amount"},
             "then": {"severity": "CRITICAL"}}
        ]));
        let envelope = triaged(event_types::TRIAGE_COMPLETED);
        let outcome = handle(&HandlerInput {
            state: Some(&row),
            progress: &[],
            envelope: &envelope,
            snapshot: &snapshot,
        })
        .unwrap();
        assert!(outcome.update.unwrap().severity.is_none());
    }

    #[test]
    fn terminal_exception_refuses_reopen() {
        let mut row = row(PipelineStage::Terminal);
        row.status = ExceptionStatus::Closed;
        let snapshot = snapshot_with_rules(json!([]));
        let envelope = triaged(event_types::POLICY_REQUESTED);
        let err = handle(&HandlerInput {
            state: Some(&row),
            progress: &[],
            envelope: &envelope,
            snapshot: &snapshot,
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StalePrecondition);
    }

    #[test]
    fn sla_imminent_is_acknowledged_without_mutation() {
        let row = row(PipelineStage::Step);
        let snapshot = snapshot_with_rules(json!([]));
        let envelope = triaged(event_types::SLA_IMMINENT);
        let outcome = handle(&HandlerInput {
            state: Some(&row),
            progress: &[],
            envelope: &envelope,
            snapshot: &snapshot,
        })
        .unwrap();
        assert!(outcome.is_empty());
    }

    #[test]
    fn reopen_from_escalated_passes_through_open() {
        let mut row = row(PipelineStage::Terminal);
        row.status = ExceptionStatus::Escalated;
        row.normalized_payload = Some(json!({"amount": 10, "features": {}}));
        let snapshot = snapshot_with_rules(json!([
            {"name": "settle", "when": {"op": "exists", "field": "payload.amount"},
             "then": {"candidate_playbooks": ["PB_SETTLE"]}}
        ]));
        let envelope = triaged(event_types::POLICY_REQUESTED);
        let outcome = handle(&HandlerInput {
            state: Some(&row),
            progress: &[],
            envelope: &envelope,
            snapshot: &snapshot,
        })
        .unwrap();
        let update = outcome.update.unwrap();
        assert_eq!(update.status, Some(ExceptionStatus::Open));
        assert_eq!(update.current_stage, Some(PipelineStage::Playbook));
    }
}

use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};

use crate::config::WorkerRole;
use crate::db::exception_events::{timeline, NewExceptionEvent};
use crate::db::exceptions::{ExceptionUpdate, PipelineStage};
use crate::envelope::{event_types, topics};
use crate::error::ProcessingError;
use crate::handlers::{outbound_envelope, HandlerInput, HandlerOutcome, OutboundMessage};

/// Triage: derives the declared features from the normalized payload, arms
/// the SLA deadline from the tenant policy's SLA table, and forwards to
/// policy. Never touches severity.
pub fn handle(input: &HandlerInput<'_>) -> Result<HandlerOutcome, ProcessingError> {
    let row = input.require_state()?;
    input.require_stage(row, PipelineStage::Triage)?;

    let normalized = row
        .normalized_payload
        .clone()
        .ok_or_else(|| ProcessingError::Permanent("triage requires a normalized payload".into()))?;

    let type_def = input
        .snapshot
        .domain_pack
        .exception_types
        .get(&row.exception_type)
        .ok_or_else(|| {
            ProcessingError::Permanent(format!("unknown exception_type {}", row.exception_type))
        })?;

    let mut features = Map::new();
    for (feature, source_field) in &type_def.features {
        if let Some(value) = normalized.get(source_field) {
            features.insert(feature.clone(), value.clone());
        }
    }

    let sla_minutes = input
        .snapshot
        .policy_pack
        .sla_minutes(&row.exception_type, row.severity);
    if let Some(minutes) = sla_minutes {
        features.insert("sla_class".into(), json!(format!("{minutes}m")));
    }
    let sla_deadline = sla_minutes.map(|minutes| Utc::now() + Duration::minutes(minutes));

    let mut enriched = normalized.as_object().cloned().unwrap_or_default();
    enriched.insert("features".into(), Value::Object(features.clone()));
    let enriched = Value::Object(enriched);

    let mut update = ExceptionUpdate {
        normalized_payload: Some(enriched),
        current_stage: Some(PipelineStage::Policy),
        ..ExceptionUpdate::default()
    };
    update.sla_deadline = sla_deadline;

    let mut outcome = HandlerOutcome {
        update: Some(update),
        expected_version: Some(row.version),
        ..HandlerOutcome::default()
    };

    outcome.events.push(NewExceptionEvent::system(
        timeline::TRIAGE_COMPLETED,
        WorkerRole::Triage.as_str(),
        input.envelope.attempt,
        json!({
            "features": features,
            "sla_deadline": sla_deadline,
        }),
    ));

    outcome.outbound.push(OutboundMessage {
        topic: topics::TRIAGE_COMPLETED,
        envelope: outbound_envelope(
            input.envelope,
            event_types::TRIAGE_COMPLETED,
            WorkerRole::Triage,
            json!({ "features": features }),
        ),
    });

    Ok(outcome)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::exceptions::{ExceptionRow, ExceptionStatus, Severity};
    use crate::envelope::EventEnvelope;
    use crate::error::ErrorKind;
    use crate::registry::ConfigSnapshot;
    use uuid::Uuid;

    pub(crate) fn snapshot() -> ConfigSnapshot {
        ConfigSnapshot {
            tenant_id: "T1".into(),
            domain: "finance".into(),
            version: 1,
            domain_pack: serde_json::from_value(json!({
                "exception_types": {
                    "SETTLEMENT_FAIL": {
                        "required_fields": ["amount"],
                        "default_severity": "HIGH",
                        "features": {"amount": "amount", "counterparty": "counterparty"}
                    }
                }
            }))
            .unwrap(),
            policy_pack: serde_json::from_value(json!({
                "sla": [{"exception_type": "SETTLEMENT_FAIL", "severity": "HIGH", "minutes": 240}]
            }))
            .unwrap(),
            playbook_catalog: serde_json::from_value(json!({})).unwrap(),
        }
    }

    pub(crate) fn row(stage: PipelineStage) -> ExceptionRow {
        ExceptionRow {
            tenant_id: "T1".into(),
            exception_id: Uuid::new_v4(),
            source_system: "ERP".into(),
            domain: "finance".into(),
            exception_type: "SETTLEMENT_FAIL".into(),
            severity: Severity::High,
            status: ExceptionStatus::Open,
            current_stage: stage,
            raw_payload: json!({"type": "SETTLEMENT_FAIL", "amount": 1000}),
            normalized_payload: Some(json!({"amount": 1000, "counterparty": "ACME"})),
            current_playbook_id: None,
            current_playbook_version: None,
            current_step: None,
            severity_overridden: false,
            required_approvals: 0,
            correlation_id: Some("corr-1".into()),
            sla_deadline: None,
            last_sla_emitted: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            version: 1,
        }
    }

    #[test]
    fn triage_extracts_features_and_arms_sla() {
        let row = row(PipelineStage::Triage);
        let envelope = EventEnvelope::new(
            event_types::EXCEPTION_NORMALIZED,
            "T1",
            row.exception_id,
            "intake",
            "corr-1",
            json!({}),
        );
        let snapshot = snapshot();
        let outcome = handle(&HandlerInput {
            state: Some(&row),
            progress: &[],
            envelope: &envelope,
            snapshot: &snapshot,
        })
        .unwrap();

        let update = outcome.update.unwrap();
        assert!(update.sla_deadline.is_some());
        assert_eq!(update.current_stage, Some(PipelineStage::Policy));
        let enriched = update.normalized_payload.unwrap();
        assert_eq!(enriched["features"]["amount"], json!(1000));
        assert_eq!(enriched["features"]["counterparty"], json!("ACME"));
        // Severity never changes in triage.
        assert!(update.severity.is_none());
    }

    #[test]
    fn replay_after_stage_moved_is_stale() {
        let row = row(PipelineStage::Playbook);
        let envelope = EventEnvelope::new(
            event_types::EXCEPTION_NORMALIZED,
            "T1",
            row.exception_id,
            "intake",
            "corr-1",
            json!({}),
        );
        let snapshot = snapshot();
        let err = handle(&HandlerInput {
            state: Some(&row),
            progress: &[],
            envelope: &envelope,
            snapshot: &snapshot,
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StalePrecondition);
    }
}

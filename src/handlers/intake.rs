use serde_json::{json, Map, Value};

use crate::config::WorkerRole;
use crate::db::exception_events::{timeline, NewExceptionEvent};
use crate::envelope::{event_types, topics};
use crate::error::ProcessingError;
use crate::handlers::{outbound_envelope, HandlerInput, HandlerOutcome, OutboundMessage};
use crate::registry::ExceptionTypeDef;

/// Intake: validates the raw payload against the domain pack, computes the
/// canonical exception type and initial severity, creates the aggregate, and
/// hands it to triage.
pub fn handle(input: &HandlerInput<'_>) -> Result<HandlerOutcome, ProcessingError> {
    if input.state.is_some() {
        // Concurrent or replayed ingest of the same identity; the first
        // create won.
        return Err(ProcessingError::StalePrecondition(format!(
            "exception {} already created",
            input.envelope.exception_id
        )));
    }

    let payload = &input.envelope.payload;
    let source_system = crate::handlers::payload_str(payload, "source_system")?;
    let domain = crate::handlers::payload_str(payload, "domain")?;
    let raw_payload = payload
        .get("raw_payload")
        .cloned()
        .ok_or_else(|| ProcessingError::schema_rejected("missing raw_payload"))?;
    if !raw_payload.is_object() {
        return Err(ProcessingError::schema_rejected("raw_payload must be an object"));
    }

    let pack = &input.snapshot.domain_pack;
    let exception_type = raw_payload
        .get(&pack.type_field)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ProcessingError::schema_rejected(format!(
                "raw payload missing `{}` discriminator",
                pack.type_field
            ))
        })?
        .to_string();

    let type_def = pack.exception_types.get(&exception_type).ok_or_else(|| {
        ProcessingError::Permanent(format!("unknown exception_type {exception_type}"))
    })?;

    let normalized = normalize(&raw_payload, &pack.type_field, type_def, &exception_type)?;
    let severity = type_def.default_severity;

    let mut outcome = HandlerOutcome {
        create: Some(crate::handlers::CreateException {
            source_system: source_system.to_string(),
            domain: domain.to_string(),
            exception_type: exception_type.clone(),
            severity,
            raw_payload: raw_payload.clone(),
            normalized_payload: normalized.clone(),
            correlation_id: Some(input.envelope.correlation_id.clone()),
        }),
        ..HandlerOutcome::default()
    };

    outcome.events.push(NewExceptionEvent::system(
        timeline::EXCEPTION_CREATED,
        WorkerRole::Intake.as_str(),
        input.envelope.attempt,
        json!({
            "source_system": source_system,
            "domain": domain,
            "exception_type": exception_type,
            "severity": severity,
        }),
    ));
    outcome.events.push(NewExceptionEvent::system(
        timeline::EXCEPTION_NORMALIZED,
        WorkerRole::Intake.as_str(),
        input.envelope.attempt,
        json!({ "normalized_payload": normalized }),
    ));

    outcome.outbound.push(OutboundMessage {
        topic: topics::EXCEPTIONS_NORMALIZED,
        envelope: outbound_envelope(
            input.envelope,
            event_types::EXCEPTION_NORMALIZED,
            WorkerRole::Intake,
            json!({
                "exception_type": exception_type,
                "severity": severity,
                "normalized_payload": normalized,
            }),
        ),
    });

    Ok(outcome)
}

/// Domain validation: required fields must be present, declared fields must
/// carry their declared shape. The normalized document is the raw payload
/// minus the type discriminator.
fn normalize(
    raw: &Value,
    type_field: &str,
    type_def: &ExceptionTypeDef,
    exception_type: &str,
) -> Result<Value, ProcessingError> {
    let fields = raw
        .as_object()
        .ok_or_else(|| ProcessingError::schema_rejected("raw_payload must be an object"))?;

    for required in &type_def.required_fields {
        if !fields.contains_key(required) {
            return Err(ProcessingError::schema_rejected(format!(
                "{exception_type} requires field `{required}`"
            )));
        }
    }
    for (field, expected) in &type_def.field_types {
        if let Some(value) = fields.get(field) {
            if !expected.admits(value) {
                return Err(ProcessingError::schema_rejected(format!(
                    "{exception_type} field `{field}` has wrong type"
                )));
            }
        }
    }

    let mut normalized = Map::new();
    for (key, value) in fields {
        if key != type_field {
            normalized.insert(key.clone(), value.clone());
        }
    }
    Ok(Value::Object(normalized))
}

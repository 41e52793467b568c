use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::db::exceptions::{ExceptionRow, Severity};
use crate::registry::{PolicyPack, RuleEffect};

/// Nesting budget for condition trees. Packs deeper than this evaluate
/// false rather than recursing further; the language stays total.
const MAX_CONDITION_DEPTH: usize = 32;

/// Rule condition: a small, side-effect-free expression tree shipped inside
/// policy packs as a JSON AST and evaluated by a hand-written walker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    And { args: Vec<Condition> },
    Or { args: Vec<Condition> },
    Not { arg: Box<Condition> },
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    Gt { field: String, value: Value },
    Gte { field: String, value: Value },
    Lt { field: String, value: Value },
    Lte { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    Exists { field: String },
    Matches { field: String, pattern: String },
}

impl Condition {
    pub fn eval(&self, facts: &Value) -> bool {
        self.eval_at(facts, 0)
    }

    fn eval_at(&self, facts: &Value, depth: usize) -> bool {
        if depth > MAX_CONDITION_DEPTH {
            warn!("condition tree exceeds depth budget; evaluating false");
            return false;
        }
        match self {
            Condition::And { args } => args.iter().all(|c| c.eval_at(facts, depth + 1)),
            Condition::Or { args } => args.iter().any(|c| c.eval_at(facts, depth + 1)),
            Condition::Not { arg } => !arg.eval_at(facts, depth + 1),
            Condition::Eq { field, value } => {
                lookup(facts, field).map_or(false, |found| values_equal(found, value))
            }
            Condition::Ne { field, value } => {
                lookup(facts, field).map_or(false, |found| !values_equal(found, value))
            }
            Condition::Gt { field, value } => compare(facts, field, value)
                .map_or(false, |ordering| ordering == std::cmp::Ordering::Greater),
            Condition::Gte { field, value } => compare(facts, field, value)
                .map_or(false, |ordering| ordering != std::cmp::Ordering::Less),
            Condition::Lt { field, value } => compare(facts, field, value)
                .map_or(false, |ordering| ordering == std::cmp::Ordering::Less),
            Condition::Lte { field, value } => compare(facts, field, value)
                .map_or(false, |ordering| ordering != std::cmp::Ordering::Greater),
            Condition::In { field, values } => lookup(facts, field)
                .map_or(false, |found| values.iter().any(|v| values_equal(found, v))),
            Condition::Exists { field } => {
                lookup(facts, field).map_or(false, |found| !found.is_null())
            }
            Condition::Matches { field, pattern } => {
                let Some(Value::String(found)) = lookup(facts, field) else {
                    return false;
                };
                match regex::Regex::new(&format!("^(?:{pattern})$")) {
                    Ok(re) => re.is_match(found),
                    Err(err) => {
                        warn!(pattern, ?err, "invalid pattern in policy condition");
                        false
                    }
                }
            }
        }
    }
}

/// Dotted-path access into the fact document. Missing segments resolve to
/// nothing, so every operator degrades to false instead of failing.
fn lookup<'a>(facts: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = facts;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(facts: &Value, field: &str, rhs: &Value) -> Option<std::cmp::Ordering> {
    let lhs = lookup(facts, field)?;
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => match (lhs.as_str(), rhs.as_str()) {
            (Some(x), Some(y)) => Some(x.cmp(y)),
            _ => None,
        },
    }
}

/// Output of one deterministic policy evaluation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PolicyDecision {
    pub severity_override: Option<Severity>,
    pub required_approvals: i32,
    pub escalate: bool,
    pub reject: bool,
    pub candidate_playbooks: Vec<String>,
    pub matched_rules: Vec<String>,
}

/// Walks the pack's rules in declared order, merging effects. Short-circuits
/// on the first escalating or rejecting rule. Severity effects are dropped
/// when the exception has already consumed its one override.
pub fn evaluate(pack: &PolicyPack, facts: &Value, allow_severity_override: bool) -> PolicyDecision {
    let mut decision = PolicyDecision::default();
    for rule in &pack.rules {
        if !rule.when.eval(facts) {
            continue;
        }
        decision.matched_rules.push(rule.name.clone());
        apply_effect(&mut decision, &rule.then, allow_severity_override);
        if decision.escalate || decision.reject {
            break;
        }
    }
    decision
}

fn apply_effect(decision: &mut PolicyDecision, effect: &RuleEffect, allow_severity_override: bool) {
    if allow_severity_override {
        if let Some(severity) = effect.severity {
            decision.severity_override = Some(severity);
        }
    }
    if let Some(approvals) = effect.required_approvals {
        decision.required_approvals = decision.required_approvals.max(approvals);
    }
    if effect.escalate {
        decision.escalate = true;
    }
    if effect.reject {
        decision.reject = true;
    }
    for candidate in &effect.candidate_playbooks {
        if !decision.candidate_playbooks.contains(candidate) {
            decision.candidate_playbooks.push(candidate.clone());
        }
    }
}

/// Fact document rules evaluate against: core attributes plus the normalized
/// payload and the triage features nested inside it.
pub fn build_facts(row: &ExceptionRow) -> Value {
    let payload = row
        .normalized_payload
        .clone()
        .unwrap_or_else(|| row.raw_payload.clone());
    let features = payload.get("features").cloned().unwrap_or(json!({}));
    json!({
        "tenant_id": row.tenant_id,
        "exception_id": row.exception_id,
        "source_system": row.source_system,
        "domain": row.domain,
        "exception_type": row.exception_type,
        "severity": row.severity.as_str(),
        "status": row.status,
        "required_approvals": row.required_approvals,
        "payload": payload,
        "features": features,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts() -> Value {
        json!({
            "exception_type": "SETTLEMENT_FAIL",
            "severity": "MEDIUM",
            "payload": {"amount": 5_000_000.0, "counterparty": "ACME-GLOBAL"},
            "features": {"sla_class": "fast"}
        })
    }

    fn parse(raw: Value) -> Condition {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn comparisons_and_boolean_ops() {
        let cond = parse(json!({
            "op": "and",
            "args": [
                {"op": "gt", "field": "payload.amount", "value": 1_000_000},
                {"op": "eq", "field": "exception_type", "value": "SETTLEMENT_FAIL"},
                {"op": "not", "arg": {"op": "eq", "field": "severity", "value": "CRITICAL"}}
            ]
        }));
        assert!(cond.eval(&facts()));
    }

    #[test]
    fn missing_fields_evaluate_false_not_error() {
        let cond = parse(json!({"op": "gt", "field": "payload.missing.deep", "value": 1}));
        assert!(!cond.eval(&facts()));
        let cond = parse(json!({"op": "exists", "field": "payload.counterparty"}));
        assert!(cond.eval(&facts()));
    }

    #[test]
    fn in_and_matches_operators() {
        let cond = parse(json!({
            "op": "in", "field": "features.sla_class", "values": ["fast", "standard"]
        }));
        assert!(cond.eval(&facts()));
        let cond = parse(json!({
            "op": "matches", "field": "payload.counterparty", "pattern": "ACME-.*"
        }));
        assert!(cond.eval(&facts()));
        // Anchored: a partial match is not a match.
        let cond = parse(json!({
            "op": "matches", "field": "payload.counterparty", "pattern": "ACME"
        }));
        assert!(!cond.eval(&facts()));
    }

    #[test]
    fn invalid_pattern_is_false_not_panic() {
        let cond = parse(json!({
            "op": "matches", "field": "payload.counterparty", "pattern": "("
        }));
        assert!(!cond.eval(&facts()));
    }

    fn pack(rules: Value) -> PolicyPack {
        serde_json::from_value(json!({ "rules": rules })).unwrap()
    }

    #[test]
    fn escalation_short_circuits_later_rules() {
        let pack = pack(json!([
            {"name": "big-break", "when": {"op": "gt", "field": "payload.amount", "value": 1_000_000},
             "then": {"escalate": true}},
            {"name": "never-reached", "when": {"op": "exists", "field": "payload.amount"},
             "then": {"candidate_playbooks": ["PB_SETTLE"]}}
        ]));
        let decision = evaluate(&pack, &facts(), true);
        assert!(decision.escalate);
        assert!(decision.candidate_playbooks.is_empty());
        assert_eq!(decision.matched_rules, vec!["big-break"]);
    }

    #[test]
    fn severity_override_respects_the_once_flag() {
        let pack = pack(json!([
            {"name": "bump", "when": {"op": "exists", "field": "payload.amount"},
             "then": {"severity": "CRITICAL"}}
        ]));
        assert_eq!(
            evaluate(&pack, &facts(), true).severity_override,
            Some(Severity::Critical)
        );
        assert_eq!(evaluate(&pack, &facts(), false).severity_override, None);
    }

    #[test]
    fn candidates_accumulate_without_duplicates() {
        let pack = pack(json!([
            {"name": "a", "when": {"op": "exists", "field": "payload.amount"},
             "then": {"candidate_playbooks": ["PB_SETTLE", "PB_NOTIFY"]}},
            {"name": "b", "when": {"op": "exists", "field": "payload.counterparty"},
             "then": {"candidate_playbooks": ["PB_SETTLE"], "required_approvals": 1}}
        ]));
        let decision = evaluate(&pack, &facts(), true);
        assert_eq!(decision.candidate_playbooks, vec!["PB_SETTLE", "PB_NOTIFY"]);
        assert_eq!(decision.required_approvals, 1);
    }
}

use crate::db::exceptions::Severity;
use crate::registry::{PlaybookCatalog, PlaybookDef, RankingConfig};

/// Chosen playbook plus the score that won it, for the audit trail.
#[derive(Debug, Clone)]
pub struct PlaybookSelection<'a> {
    pub playbook: &'a PlaybookDef,
    pub score: f64,
}

/// Scores the candidate set against the pack's ranking weights and picks the
/// winner. Candidates resolve to their latest catalog version; ids absent
/// from the catalog score nothing. Ties break on the lower lexicographic
/// playbook id. Returns None when no candidate reaches the threshold.
pub fn select_playbook<'a>(
    catalog: &'a PlaybookCatalog,
    candidates: &[String],
    exception_type: &str,
    severity: Severity,
    tags: &[String],
    ranking: &RankingConfig,
) -> Option<PlaybookSelection<'a>> {
    let mut best: Option<PlaybookSelection<'a>> = None;
    for candidate in candidates {
        let Some(playbook) = catalog.latest(candidate) else {
            continue;
        };
        let score = score_playbook(playbook, exception_type, severity, tags, ranking);
        if score < ranking.threshold {
            continue;
        }
        let replace = match &best {
            None => true,
            Some(current) => {
                score > current.score
                    || (score == current.score
                        && playbook.playbook_id < current.playbook.playbook_id)
            }
        };
        if replace {
            best = Some(PlaybookSelection { playbook, score });
        }
    }
    best
}

fn score_playbook(
    playbook: &PlaybookDef,
    exception_type: &str,
    severity: Severity,
    tags: &[String],
    ranking: &RankingConfig,
) -> f64 {
    let spec = &playbook.match_spec;
    let mut score = 0.0;
    if spec
        .exception_types
        .iter()
        .any(|t| t == exception_type)
    {
        score += ranking.weights.type_match;
    }
    if let Some(min) = spec.min_severity {
        if severity >= min {
            score += ranking.weights.severity_match;
        }
    }
    let overlap = spec.tags.iter().filter(|t| tags.contains(t)).count();
    score += overlap as f64 * ranking.weights.tag_overlap;
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog() -> PlaybookCatalog {
        serde_json::from_value(json!({
            "playbooks": [
                {"playbook_id": "PB_SETTLE", "version": 3, "name": "settlement repair",
                 "match": {"exception_types": ["SETTLEMENT_FAIL"], "min_severity": "MEDIUM"},
                 "steps": [{"step_order": 1, "name": "verify", "action_type": "tool",
                            "action_config": {"tool_id": "ssi-verify"}}]},
                {"playbook_id": "PB_NOTIFY", "version": 1, "name": "notify desk",
                 "match": {"exception_types": ["SETTLEMENT_FAIL"], "min_severity": "MEDIUM"},
                 "steps": [{"step_order": 1, "name": "notify", "action_type": "human"}]},
                {"playbook_id": "PB_WEAK", "version": 1, "name": "weak fit",
                 "match": {"tags": ["reconciliation"]},
                 "steps": [{"step_order": 1, "name": "review", "action_type": "human"}]}
            ]
        }))
        .unwrap()
    }

    fn candidates(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn equal_scores_break_ties_lexicographically() {
        let catalog = catalog();
        let selection = select_playbook(
            &catalog,
            &candidates(&["PB_SETTLE", "PB_NOTIFY"]),
            "SETTLEMENT_FAIL",
            Severity::High,
            &[],
            &RankingConfig::default(),
        )
        .unwrap();
        assert_eq!(selection.playbook.playbook_id, "PB_NOTIFY");
    }

    #[test]
    fn below_threshold_candidates_are_rejected() {
        let catalog = catalog();
        let selection = select_playbook(
            &catalog,
            &candidates(&["PB_WEAK"]),
            "SETTLEMENT_FAIL",
            Severity::High,
            &[],
            &RankingConfig::default(),
        );
        assert!(selection.is_none());
    }

    #[test]
    fn severity_gate_requires_minimum() {
        let catalog = catalog();
        let selection = select_playbook(
            &catalog,
            &candidates(&["PB_SETTLE"]),
            "SETTLEMENT_FAIL",
            Severity::Low,
            &[],
            &RankingConfig::default(),
        )
        .unwrap();
        // Type still matches, severity bonus does not.
        assert_eq!(selection.score, RankingConfig::default().weights.type_match);
    }

    #[test]
    fn unknown_candidate_ids_score_nothing() {
        let catalog = catalog();
        let selection = select_playbook(
            &catalog,
            &candidates(&["PB_GHOST"]),
            "SETTLEMENT_FAIL",
            Severity::High,
            &[],
            &RankingConfig::default(),
        );
        assert!(selection.is_none());
    }
}

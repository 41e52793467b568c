use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;

use crate::config;
use crate::db::config_documents::{
    self, KIND_DOMAIN_PACK, KIND_PLAYBOOK_CATALOG, KIND_POLICY_PACK,
};
use crate::db::exceptions::Severity;
use crate::error::ProcessingError;
use crate::policy::Condition;

/// Declared value shape for a normalized field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    pub fn admits(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionTypeDef {
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub field_types: HashMap<String, FieldType>,
    pub default_severity: Severity,
    /// Feature name → source field in the normalized payload, extracted by
    /// triage.
    #[serde(default)]
    pub features: HashMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Validated schemas and enums for one business domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainPack {
    /// Raw-payload field carrying the source system's type discriminator.
    #[serde(default = "default_type_field")]
    pub type_field: String,
    pub exception_types: HashMap<String, ExceptionTypeDef>,
}

fn default_type_field() -> String {
    "type".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleEffect {
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub required_approvals: Option<i32>,
    #[serde(default)]
    pub escalate: bool,
    #[serde(default)]
    pub reject: bool,
    #[serde(default)]
    pub candidate_playbooks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,
    pub when: Condition,
    #[serde(default)]
    pub then: RuleEffect,
}

/// One row of the pack's SLA table. Omitted dimensions are wildcards; the
/// most specific matching row wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaEntry {
    #[serde(default)]
    pub exception_type: Option<String>,
    #[serde(default)]
    pub severity: Option<Severity>,
    pub minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingWeights {
    #[serde(default = "default_type_weight")]
    pub type_match: f64,
    #[serde(default = "default_severity_weight")]
    pub severity_match: f64,
    #[serde(default = "default_tag_weight")]
    pub tag_overlap: f64,
}

fn default_type_weight() -> f64 {
    3.0
}
fn default_severity_weight() -> f64 {
    2.0
}
fn default_tag_weight() -> f64 {
    1.0
}

impl Default for RankingWeights {
    fn default() -> Self {
        RankingWeights {
            type_match: default_type_weight(),
            severity_match: default_severity_weight(),
            tag_overlap: default_tag_weight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingConfig {
    #[serde(default)]
    pub weights: RankingWeights,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

fn default_threshold() -> f64 {
    1.0
}

impl Default for RankingConfig {
    fn default() -> Self {
        RankingConfig {
            weights: RankingWeights::default(),
            threshold: default_threshold(),
        }
    }
}

/// Tenant rules over normalized exceptions: severity, approvals, escalation,
/// playbook candidates, and the SLA table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyPack {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub sla: Vec<SlaEntry>,
    #[serde(default = "default_imminent_window")]
    pub imminent_window_minutes: i64,
    #[serde(default = "default_resolution_seconds")]
    pub resolution_seconds: u64,
    #[serde(default)]
    pub ranking: RankingConfig,
}

fn default_imminent_window() -> i64 {
    10
}
fn default_resolution_seconds() -> u64 {
    60
}

impl PolicyPack {
    /// SLA duration for `(exception_type, severity)`: exact match, then
    /// type-only, then severity-only, then the wildcard row.
    pub fn sla_minutes(&self, exception_type: &str, severity: Severity) -> Option<i64> {
        let mut best: Option<(u8, i64)> = None;
        for entry in &self.sla {
            let type_ok = entry
                .exception_type
                .as_deref()
                .map_or(true, |t| t == exception_type);
            let severity_ok = entry.severity.map_or(true, |s| s == severity);
            if !type_ok || !severity_ok {
                continue;
            }
            let specificity = u8::from(entry.exception_type.is_some()) * 2
                + u8::from(entry.severity.is_some());
            if best.map_or(true, |(current, _)| specificity > current) {
                best = Some((specificity, entry.minutes));
            }
        }
        best.map(|(_, minutes)| minutes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Tool,
    Human,
    Decision,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Tool => "tool",
            ActionType::Human => "human",
            ActionType::Decision => "decision",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailurePolicy {
    Retry { max_attempts: i32 },
    Skip,
    Escalate,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::Escalate
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaybookMatchSpec {
    #[serde(default)]
    pub exception_types: Vec<String>,
    #[serde(default)]
    pub min_severity: Option<Severity>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub step_order: i32,
    pub name: String,
    pub action_type: ActionType,
    #[serde(default)]
    pub action_config: Value,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// Immutable, versioned remediation recipe. Edits require a new version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookDef {
    pub playbook_id: String,
    pub version: i32,
    pub name: String,
    #[serde(default, rename = "match")]
    pub match_spec: PlaybookMatchSpec,
    pub steps: Vec<StepDef>,
}

impl PlaybookDef {
    pub fn total_steps(&self) -> i32 {
        self.steps.len() as i32
    }

    pub fn step(&self, step_order: i32) -> Option<&StepDef> {
        self.steps.iter().find(|s| s.step_order == step_order)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookCatalog {
    #[serde(default)]
    pub playbooks: Vec<PlaybookDef>,
}

impl PlaybookCatalog {
    /// Highest published version of a playbook id.
    pub fn latest(&self, playbook_id: &str) -> Option<&PlaybookDef> {
        self.playbooks
            .iter()
            .filter(|p| p.playbook_id == playbook_id)
            .max_by_key(|p| p.version)
    }

    /// Exact `(playbook_id, version)` lookup for in-flight progress.
    pub fn get(&self, playbook_id: &str, version: i32) -> Option<&PlaybookDef> {
        self.playbooks
            .iter()
            .find(|p| p.playbook_id == playbook_id && p.version == version)
    }
}

/// Immutable document set a handler resolves once per invocation.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub tenant_id: String,
    pub domain: String,
    pub version: i32,
    pub domain_pack: DomainPack,
    pub policy_pack: PolicyPack,
    pub playbook_catalog: PlaybookCatalog,
}

struct CachedSnapshot {
    snapshot: Arc<ConfigSnapshot>,
    loaded_at: Instant,
}

/// Per-process snapshot cache over `config_documents`. TTL-bounded, with
/// explicit invalidation for config-publish tooling.
pub struct ConfigRegistry {
    pool: PgPool,
    cache: DashMap<(String, String), CachedSnapshot>,
    ttl: Duration,
}

impl ConfigRegistry {
    pub fn new(pool: PgPool) -> Self {
        ConfigRegistry {
            pool,
            cache: DashMap::new(),
            ttl: Duration::from_secs(*config::CONFIG_CACHE_TTL_SECONDS),
        }
    }

    pub fn with_ttl(pool: PgPool, ttl: Duration) -> Self {
        ConfigRegistry {
            pool,
            cache: DashMap::new(),
            ttl,
        }
    }

    pub async fn snapshot(
        &self,
        tenant_id: &str,
        domain: &str,
    ) -> Result<Arc<ConfigSnapshot>, ProcessingError> {
        let cache_key = (tenant_id.to_string(), domain.to_string());
        if let Some(cached) = self.cache.get(&cache_key) {
            if cached.loaded_at.elapsed() < self.ttl {
                return Ok(cached.snapshot.clone());
            }
        }

        let snapshot = Arc::new(load_snapshot(&self.pool, tenant_id, domain).await?);
        self.cache.insert(
            cache_key,
            CachedSnapshot {
                snapshot: snapshot.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(snapshot)
    }

    pub fn invalidate(&self, tenant_id: &str, domain: &str) {
        self.cache
            .remove(&(tenant_id.to_string(), domain.to_string()));
    }

    pub fn invalidate_all(&self) {
        self.cache.clear();
    }
}

async fn load_snapshot(
    pool: &PgPool,
    tenant_id: &str,
    domain: &str,
) -> Result<ConfigSnapshot, ProcessingError> {
    let documents = config_documents::latest(pool, tenant_id, domain).await?;

    let mut domain_pack: Option<(i32, DomainPack)> = None;
    let mut policy_pack: Option<(i32, PolicyPack)> = None;
    let mut playbook_catalog: Option<(i32, PlaybookCatalog)> = None;

    for doc in documents {
        match doc.kind.as_str() {
            KIND_DOMAIN_PACK => {
                let pack: DomainPack = parse_pack(&doc.document, KIND_DOMAIN_PACK)?;
                domain_pack = Some((doc.version, pack));
            }
            KIND_POLICY_PACK => {
                let pack: PolicyPack = parse_pack(&doc.document, KIND_POLICY_PACK)?;
                policy_pack = Some((doc.version, pack));
            }
            KIND_PLAYBOOK_CATALOG => {
                let catalog: PlaybookCatalog = parse_pack(&doc.document, KIND_PLAYBOOK_CATALOG)?;
                validate_catalog(&catalog)?;
                playbook_catalog = Some((doc.version, catalog));
            }
            other => {
                tracing::warn!(tenant_id, domain, kind = other, "unknown config document kind");
            }
        }
    }

    let (domain_version, domain_pack) = domain_pack.ok_or_else(|| {
        ProcessingError::ConfigMissing(format!("no domain pack for {tenant_id}/{domain}"))
    })?;
    let (policy_version, policy_pack) = policy_pack.ok_or_else(|| {
        ProcessingError::ConfigMissing(format!("no policy pack for {tenant_id}/{domain}"))
    })?;
    let (catalog_version, playbook_catalog) = playbook_catalog.ok_or_else(|| {
        ProcessingError::ConfigMissing(format!("no playbook catalog for {tenant_id}/{domain}"))
    })?;

    Ok(ConfigSnapshot {
        tenant_id: tenant_id.to_string(),
        domain: domain.to_string(),
        version: domain_version.max(policy_version).max(catalog_version),
        domain_pack,
        policy_pack,
        playbook_catalog,
    })
}

fn parse_pack<T: serde::de::DeserializeOwned>(
    document: &Value,
    kind: &str,
) -> Result<T, ProcessingError> {
    serde_json::from_value(document.clone())
        .map_err(|err| ProcessingError::Permanent(format!("invalid {kind}: {err}")))
}

fn validate_catalog(catalog: &PlaybookCatalog) -> Result<(), ProcessingError> {
    for playbook in &catalog.playbooks {
        if playbook.steps.is_empty() {
            return Err(ProcessingError::Permanent(format!(
                "playbook {} v{} has no steps",
                playbook.playbook_id, playbook.version
            )));
        }
        for (index, step) in playbook.steps.iter().enumerate() {
            if step.step_order != index as i32 + 1 {
                return Err(ProcessingError::Permanent(format!(
                    "playbook {} v{} steps are not contiguous from 1",
                    playbook.playbook_id, playbook.version
                )));
            }
        }
    }
    Ok(())
}

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use backend::broker::{Broker, PgBroker};
use backend::config::{WorkerConfig, WorkerRole};
use backend::db::config_documents;
use backend::envelope::{topics, topics_for_role};
use backend::ingest::{self, IngestRequest};
use backend::outbox;
use backend::registry::ConfigRegistry;
use backend::retry::{self, RetryPolicy};
use backend::runtime::{process_delivery, WorkerContext, WorkerState};
use backend::tools::ToolExecutorRegistry;

pub const TENANT: &str = "T1";
pub const DOMAIN: &str = "finance";

pub const CONSUMING_ROLES: [WorkerRole; 7] = [
    WorkerRole::Intake,
    WorkerRole::Triage,
    WorkerRole::Policy,
    WorkerRole::Playbook,
    WorkerRole::Step,
    WorkerRole::Tool,
    WorkerRole::Feedback,
];

/// In-process stand-in for the worker fleet: one context per role, driven
/// synchronously so tests can pump the pipeline to quiescence.
pub struct PipelineHarness {
    pub pool: PgPool,
    pub broker: Arc<PgBroker>,
    contexts: HashMap<WorkerRole, Arc<WorkerContext>>,
}

impl PipelineHarness {
    pub async fn new(pool: PgPool) -> Self {
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let broker = Arc::new(PgBroker::with_partitions(pool.clone(), 4, 30));

        // Retries are immediately due so tests never sleep through backoff.
        let retry_policy = RetryPolicy {
            base_backoff: Duration::ZERO,
            jitter: 0.0,
            ..RetryPolicy::default()
        };

        let mut contexts = HashMap::new();
        for role in CONSUMING_ROLES {
            let config = WorkerConfig {
                role,
                concurrency: 1,
                group_id: role.default_group_id(),
                store_url: String::new(),
                broker_url: String::new(),
                health_port: 0,
            };
            let ctx = Arc::new(WorkerContext {
                config,
                pool: pool.clone(),
                broker: broker.clone() as Arc<dyn Broker>,
                registry: Arc::new(ConfigRegistry::new(pool.clone())),
                tools: Arc::new(ToolExecutorRegistry::bootstrap()),
                retry_policy: retry_policy.clone(),
                state: WorkerState::new(),
            });
            contexts.insert(role, ctx);
        }

        PipelineHarness {
            pool,
            broker,
            contexts,
        }
    }

    pub fn context(&self, role: WorkerRole) -> &Arc<WorkerContext> {
        self.contexts.get(&role).expect("context for role")
    }

    /// Publishes the standard finance packs for tenant T1.
    pub async fn seed_default_config(&self) {
        self.seed_config(
            TENANT,
            DOMAIN,
            default_domain_pack(),
            default_policy_pack(),
            default_playbook_catalog(),
        )
        .await;
    }

    pub async fn seed_config(
        &self,
        tenant: &str,
        domain: &str,
        domain_pack: Value,
        policy_pack: Value,
        catalog: Value,
    ) {
        config_documents::publish(&self.pool, tenant, domain, "domain_pack", 1, &domain_pack)
            .await
            .unwrap();
        config_documents::publish(&self.pool, tenant, domain, "policy_pack", 1, &policy_pack)
            .await
            .unwrap();
        config_documents::publish(&self.pool, tenant, domain, "playbook_catalog", 1, &catalog)
            .await
            .unwrap();
    }

    pub async fn ingest(&self, raw_payload: Value) -> Uuid {
        self.ingest_as(TENANT, raw_payload, None).await
    }

    pub async fn ingest_as(
        &self,
        tenant: &str,
        raw_payload: Value,
        exception_id: Option<Uuid>,
    ) -> Uuid {
        let response = ingest::accept(
            self.broker.as_ref(),
            IngestRequest {
                tenant_id: tenant.to_string(),
                source_system: "ERP".to_string(),
                raw_payload,
                domain: Some(DOMAIN.to_string()),
                exception_id,
                correlation_id: None,
            },
        )
        .await
        .unwrap();
        response.exception_id
    }

    /// Drains one role's backlog. Returns how many deliveries were handled.
    pub async fn drain_role(&self, role: WorkerRole) -> usize {
        let ctx = self.context(role);
        let topics = topics_for_role(role);
        let consumer = format!("{}-test", role.as_str());
        let mut handled = 0usize;
        loop {
            match self
                .broker
                .fetch(&ctx.config.group_id, topics, &consumer)
                .await
                .unwrap()
            {
                Some(delivery) => {
                    process_delivery(ctx, delivery).await;
                    handled += 1;
                }
                None => break,
            }
        }
        handled
    }

    /// Drains `control.retry` into the schedule and re-publishes everything
    /// already due.
    pub async fn drain_retry_plane(&self) -> usize {
        let consumer = "retry-test";
        let mut handled = 0usize;
        loop {
            match self
                .broker
                .fetch("retry-workers", &[topics::CONTROL_RETRY], consumer)
                .await
                .unwrap()
            {
                Some(delivery) => {
                    retry::park_directive(&self.pool, &delivery.envelope)
                        .await
                        .unwrap();
                    self.broker.ack(&delivery).await.unwrap();
                    handled += 1;
                }
                None => break,
            }
        }
        handled += retry::dispatch_due(&self.pool, self.broker.as_ref())
            .await
            .unwrap();
        handled
    }

    /// One full sweep across outbox, retry plane, and every role. Returns
    /// the amount of work performed.
    pub async fn sweep(&self) -> usize {
        let mut work = 0usize;
        work += outbox::publish_batch(&self.pool, self.broker.as_ref())
            .await
            .unwrap();
        work += self.drain_retry_plane().await;
        for role in CONSUMING_ROLES {
            work += self.drain_role(role).await;
            work += outbox::publish_batch(&self.pool, self.broker.as_ref())
                .await
                .unwrap();
        }
        work
    }

    /// Pumps the pipeline until a sweep performs no work.
    pub async fn pump_until_quiet(&self) {
        for _ in 0..50 {
            if self.sweep().await == 0 {
                return;
            }
        }
        panic!("pipeline failed to quiesce within 50 sweeps");
    }

    /// Pumps everything except the named roles, simulating crashed workers.
    pub async fn pump_without(&self, down: &[WorkerRole]) {
        for _ in 0..50 {
            let mut work = outbox::publish_batch(&self.pool, self.broker.as_ref())
                .await
                .unwrap();
            work += self.drain_retry_plane().await;
            for role in CONSUMING_ROLES {
                if down.contains(&role) {
                    continue;
                }
                work += self.drain_role(role).await;
                work += outbox::publish_batch(&self.pool, self.broker.as_ref())
                    .await
                    .unwrap();
            }
            if work == 0 {
                return;
            }
        }
        panic!("pipeline failed to quiesce within 50 sweeps");
    }

    pub async fn timeline_types(&self, tenant: &str, exception_id: Uuid) -> Vec<String> {
        backend::db::exception_events::list(&self.pool, tenant, exception_id)
            .await
            .unwrap()
            .into_iter()
            .map(|event| event.event_type)
            .collect()
    }
}

pub fn default_domain_pack() -> Value {
    json!({
        "type_field": "type",
        "exception_types": {
            "SETTLEMENT_FAIL": {
                "required_fields": ["amount"],
                "field_types": {"amount": "number"},
                "default_severity": "HIGH",
                "features": {"amount": "amount", "counterparty": "counterparty"},
                "tags": ["settlement"]
            },
            "POSITION_BREAK": {
                "required_fields": ["amount"],
                "field_types": {"amount": "number"},
                "default_severity": "MEDIUM",
                "features": {"amount": "amount"}
            }
        }
    })
}

pub fn default_policy_pack() -> Value {
    json!({
        "rules": [
            {"name": "position-break-escalates-large",
             "when": {"op": "and", "args": [
                {"op": "eq", "field": "exception_type", "value": "POSITION_BREAK"},
                {"op": "gt", "field": "payload.amount", "value": 1_000_000}
             ]},
             "then": {"escalate": true}},
            {"name": "settlement-playbook",
             "when": {"op": "eq", "field": "exception_type", "value": "SETTLEMENT_FAIL"},
             "then": {"candidate_playbooks": ["PB_SETTLE"]}},
            {"name": "position-playbook",
             "when": {"op": "eq", "field": "exception_type", "value": "POSITION_BREAK"},
             "then": {"candidate_playbooks": ["PB_SETTLE"]}}
        ],
        "sla": [
            {"exception_type": "SETTLEMENT_FAIL", "severity": "HIGH", "minutes": 240},
            {"minutes": 1440}
        ],
        "imminent_window_minutes": 10,
        "ranking": {"threshold": 1.0}
    })
}

pub fn default_playbook_catalog() -> Value {
    json!({
        "playbooks": [
            {"playbook_id": "PB_SETTLE", "version": 3, "name": "settlement repair",
             "match": {"exception_types": ["SETTLEMENT_FAIL", "POSITION_BREAK"], "min_severity": "MEDIUM"},
             "steps": [
                {"step_order": 1, "name": "verify-ssi", "action_type": "tool",
                 "action_config": {"tool_id": "ssi-verify"}},
                {"step_order": 2, "name": "repair-instruction", "action_type": "tool",
                 "action_config": {"tool_id": "instruction-repair"}},
                {"step_order": 3, "name": "resubmit", "action_type": "tool",
                 "action_config": {"tool_id": "resubmit"}}
             ]}
        ]
    })
}

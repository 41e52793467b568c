use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, Delivery};
use crate::config::{self, WorkerConfig, WorkerRole, CAS_MAX_RETRIES};
use crate::db::exception_events::{timeline, NewExceptionEvent};
use crate::db::exceptions::{self, NewException, PipelineStage};
use crate::db::playbook_progress;
use crate::db::tool_executions::{self, NewToolExecution, ToolExecutionStatus};
use crate::db::{exception_events, exception_feedback};
use crate::envelope::{event_types, topics, topics_for_role, DlqDiversion, EventEnvelope};
use crate::error::{ErrorKind, ProcessingError};
use crate::handlers::{self, HandlerInput, HandlerOutcome, ProgressOp};
use crate::outbox;
use crate::registry::ConfigRegistry;
use crate::retry::{self, RetryPolicy};
use crate::tools::{ToolExecutorRegistry, ToolOutcome, ToolRequest};

/// Worker lifecycle per the runtime contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Init = 0,
    Ready = 1,
    Running = 2,
    Draining = 3,
    Stopped = 4,
}

/// Shared, lock-free view of the worker used by the health endpoints.
#[derive(Debug)]
pub struct WorkerState {
    lifecycle: AtomicU8,
    last_store_ok: AtomicI64,
}

impl WorkerState {
    pub fn new() -> Arc<Self> {
        Arc::new(WorkerState {
            lifecycle: AtomicU8::new(Lifecycle::Init as u8),
            last_store_ok: AtomicI64::new(0),
        })
    }

    pub fn set(&self, lifecycle: Lifecycle) {
        self.lifecycle.store(lifecycle as u8, Ordering::SeqCst);
    }

    pub fn get(&self) -> Lifecycle {
        match self.lifecycle.load(Ordering::SeqCst) {
            0 => Lifecycle::Init,
            1 => Lifecycle::Ready,
            2 => Lifecycle::Running,
            3 => Lifecycle::Draining,
            _ => Lifecycle::Stopped,
        }
    }

    /// ready → running on the first successful poll; later calls no-op.
    pub fn mark_running(&self) {
        let _ = self.lifecycle.compare_exchange(
            Lifecycle::Ready as u8,
            Lifecycle::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn mark_store_ok(&self) {
        self.last_store_ok
            .store(Utc::now().timestamp(), Ordering::SeqCst);
    }

    pub fn store_ok_within(&self, seconds: i64) -> bool {
        let last = self.last_store_ok.load(Ordering::SeqCst);
        last > 0 && Utc::now().timestamp() - last <= seconds
    }

    pub fn is_serving(&self) -> bool {
        matches!(self.get(), Lifecycle::Ready | Lifecycle::Running)
    }
}

/// Per-process dependencies handed to every handler invocation. Lifetimes
/// are bound to the worker runtime; there are no module-level singletons.
pub struct WorkerContext {
    pub config: WorkerConfig,
    pub pool: PgPool,
    pub broker: Arc<dyn Broker>,
    pub registry: Arc<ConfigRegistry>,
    pub tools: Arc<ToolExecutorRegistry>,
    pub retry_policy: RetryPolicy,
    pub state: Arc<WorkerState>,
}

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("exception version moved during commit")]
    CasConflict,
    #[error("stale commit: {0}")]
    Stale(String),
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

/// Applies a handler outcome atomically: aggregate create/CAS-update,
/// timeline rows, progress and tool child rows, feedback, and outbound
/// envelopes into the outbox. The inbound offset is acknowledged only after
/// this commits.
pub async fn commit(
    pool: &PgPool,
    tenant_id: &str,
    exception_id: Uuid,
    outcome: &HandlerOutcome,
) -> Result<(), CommitError> {
    let mut tx = pool.begin().await?;

    if let Some(create) = &outcome.create {
        let inserted = exceptions::insert(
            &mut *tx,
            NewException {
                tenant_id,
                exception_id,
                source_system: &create.source_system,
                domain: &create.domain,
                exception_type: &create.exception_type,
                severity: create.severity,
                raw_payload: &create.raw_payload,
                normalized_payload: &create.normalized_payload,
                correlation_id: create.correlation_id.as_deref(),
            },
        )
        .await?;
        if !inserted {
            tx.rollback().await?;
            return Err(CommitError::Stale(format!(
                "exception {exception_id} already exists for tenant {tenant_id}"
            )));
        }
    }

    if let Some(update) = &outcome.update {
        if !update.is_empty() {
            let expected = outcome.expected_version.ok_or_else(|| {
                CommitError::Stale("state update without an expected version".into())
            })?;
            let applied =
                exceptions::apply_update(&mut *tx, tenant_id, exception_id, expected, update)
                    .await?;
            if !applied {
                tx.rollback().await?;
                return Err(CommitError::CasConflict);
            }
        }
    }

    let mut any_event_landed = outcome.events.is_empty();
    for event in &outcome.events {
        let landed = exception_events::insert(&mut *tx, tenant_id, exception_id, event).await?;
        any_event_landed |= landed;
    }

    for op in &outcome.progress {
        match op {
            ProgressOp::SeedSteps {
                playbook_id,
                playbook_version,
                steps,
            } => {
                let rows: Vec<playbook_progress::NewProgressStep<'_>> = steps
                    .iter()
                    .map(|step| playbook_progress::NewProgressStep {
                        playbook_id,
                        playbook_version: *playbook_version,
                        step_order: step.step_order,
                        step_name: &step.name,
                        action_type: step.action_type,
                    })
                    .collect();
                playbook_progress::insert_steps(&mut tx, tenant_id, exception_id, &rows).await?;
            }
            ProgressOp::MarkInProgress { step_order } => {
                playbook_progress::mark_in_progress(&mut *tx, tenant_id, exception_id, *step_order)
                    .await?;
            }
            ProgressOp::MarkTerminal {
                step_order,
                status,
                notes,
            } => {
                playbook_progress::mark_terminal(
                    &mut *tx,
                    tenant_id,
                    exception_id,
                    *step_order,
                    *status,
                    notes.as_deref(),
                )
                .await?;
            }
        }
    }

    if let Some(feedback) = &outcome.feedback {
        exception_feedback::insert(
            &mut *tx,
            tenant_id,
            exception_id,
            &feedback.verdict,
            feedback.rationale.as_deref(),
            feedback.actor_id.as_deref(),
        )
        .await?;
    }

    if any_event_landed {
        for message in &outcome.outbound {
            outbox::enqueue(
                &mut *tx,
                message.topic,
                &message.envelope.partition_key(),
                &message.envelope,
            )
            .await?;
        }
    } else if !outcome.outbound.is_empty() {
        // Every timeline row already existed: this commit is a replay and
        // its emissions were already staged once.
        debug!(
            %exception_id,
            "replayed commit; outbound emission skipped"
        );
    }

    tx.commit().await?;
    Ok(())
}

/// Role worker: consumes the role's topics with bounded concurrency and
/// drives envelopes through handler → commit → ack.
pub struct Worker {
    ctx: Arc<WorkerContext>,
}

impl Worker {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Worker { ctx }
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let role = self.ctx.config.role;
        let topics = topics_for_role(role);
        if topics.is_empty() {
            anyhow::bail!("role {role} does not consume topics");
        }

        sqlx::query("SELECT 1").execute(&self.ctx.pool).await?;
        self.ctx.state.mark_store_ok();
        self.ctx.state.set(Lifecycle::Ready);
        info!(%role, group_id = %self.ctx.config.group_id, concurrency = self.ctx.config.concurrency, "worker ready");

        let mut slots = Vec::with_capacity(self.ctx.config.concurrency);
        for slot in 0..self.ctx.config.concurrency {
            let ctx = self.ctx.clone();
            let shutdown = shutdown.clone();
            slots.push(tokio::spawn(slot_loop(ctx, shutdown, slot)));
        }

        let drain_state = self.ctx.state.clone();
        let mut drain_rx = shutdown.clone();
        let _drain_watch = tokio::spawn(async move {
            while drain_rx.changed().await.is_ok() {
                if *drain_rx.borrow() {
                    drain_state.set(Lifecycle::Draining);
                    break;
                }
            }
        });

        futures_util::future::join_all(slots).await;
        self.ctx.state.set(Lifecycle::Stopped);
        info!(%role, "worker stopped");
        Ok(())
    }
}

async fn slot_loop(ctx: Arc<WorkerContext>, mut shutdown: watch::Receiver<bool>, slot: usize) {
    let topics = topics_for_role(ctx.config.role);
    let consumer_id = format!(
        "{}-{}-{}",
        ctx.config.group_id,
        std::process::id(),
        slot
    );
    let poll = Duration::from_millis(*config::BROKER_POLL_MILLIS);

    loop {
        if *shutdown.borrow() {
            break;
        }
        match ctx
            .broker
            .fetch(&ctx.config.group_id, topics, &consumer_id)
            .await
        {
            Ok(Some(delivery)) => {
                ctx.state.mark_running();
                ctx.state.mark_store_ok();
                process_delivery(&ctx, delivery).await;
            }
            Ok(None) => {
                ctx.state.mark_running();
                ctx.state.mark_store_ok();
                tokio::select! {
                    _ = sleep(poll) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(err) => {
                warn!(?err, slot, "broker fetch failed");
                sleep(poll).await;
            }
        }
    }
}

/// One full delivery: handler under its deadline, then ack on success or the
/// retry/DLQ path on failure. Never panics the slot.
pub async fn process_delivery(ctx: &WorkerContext, delivery: Delivery) {
    let deadline = Duration::from_secs(config::handler_deadline_seconds(ctx.config.role));
    let outcome = match tokio::time::timeout(deadline, run_handler(ctx, &delivery)).await {
        Ok(result) => result,
        Err(_) => Err(ProcessingError::Transient(
            "handler deadline exceeded".into(),
        )),
    };

    match outcome {
        Ok(()) => {
            if let Err(err) = ctx.broker.ack(&delivery).await {
                warn!(?err, topic = %delivery.topic, "ack failed after successful commit");
            }
        }
        Err(err) => dispatch_failure(ctx, &delivery, err).await,
    }
}

async fn run_handler(ctx: &WorkerContext, delivery: &Delivery) -> Result<(), ProcessingError> {
    if ctx.config.role == WorkerRole::Tool {
        handle_tool(ctx, delivery).await
    } else {
        handle_with_cas(ctx, delivery).await
    }
}

/// Resolve state + config snapshot, invoke the pure handler, commit with a
/// bounded re-read loop on version conflicts.
async fn handle_with_cas(ctx: &WorkerContext, delivery: &Delivery) -> Result<(), ProcessingError> {
    let envelope = &delivery.envelope;
    let role = ctx.config.role;

    for round in 0..CAS_MAX_RETRIES {
        let row = exceptions::get(&ctx.pool, &envelope.tenant_id, envelope.exception_id).await?;

        let domain = match (&row, role) {
            (Some(row), _) => row.domain.clone(),
            (None, WorkerRole::Intake) => envelope
                .payload
                .get("domain")
                .and_then(Value::as_str)
                .unwrap_or("default")
                .to_string(),
            (None, _) => {
                return Err(ProcessingError::Permanent(format!(
                    "no exception {} for tenant {}",
                    envelope.exception_id, envelope.tenant_id
                )))
            }
        };

        let snapshot = ctx.registry.snapshot(&envelope.tenant_id, &domain).await?;

        let progress = match (&row, role) {
            (Some(row), WorkerRole::Step) if row.current_playbook_id.is_some() => {
                playbook_progress::list(&ctx.pool, &envelope.tenant_id, envelope.exception_id)
                    .await?
            }
            _ => Vec::new(),
        };

        let input = HandlerInput {
            state: row.as_ref(),
            progress: &progress,
            envelope,
            snapshot: &snapshot,
        };
        let outcome = handlers::dispatch(role, &input)?;
        if outcome.is_empty() {
            return Ok(());
        }

        match commit(&ctx.pool, &envelope.tenant_id, envelope.exception_id, &outcome).await {
            Ok(()) => return Ok(()),
            Err(CommitError::CasConflict) => {
                debug!(round, exception_id = %envelope.exception_id, "version conflict; re-evaluating");
                continue;
            }
            Err(CommitError::Stale(message)) => {
                return Err(ProcessingError::StalePrecondition(message))
            }
            Err(CommitError::Store(err)) => return Err(err.into()),
        }
    }

    Err(ProcessingError::Transient(format!(
        "version conflict persisted across {CAS_MAX_RETRIES} evaluations"
    )))
}

/// Tool role: not a pure handler. Executes the declared effector, records
/// the execution rows, and reports the outcome on `tool.completed`.
async fn handle_tool(ctx: &WorkerContext, delivery: &Delivery) -> Result<(), ProcessingError> {
    let envelope = &delivery.envelope;
    let payload = &envelope.payload;
    let step_order = handlers::payload_i32(payload, "step_order")?;
    let tool_id = handlers::payload_str(payload, "tool_id")?.to_string();
    let executor_kind = payload
        .get("executor")
        .and_then(Value::as_str)
        .unwrap_or("simulated");
    let action_config = payload.get("action_config").cloned().unwrap_or(json!({}));
    let input_payload = payload.get("input_payload").cloned().unwrap_or(json!({}));

    let row = exceptions::get(&ctx.pool, &envelope.tenant_id, envelope.exception_id)
        .await?
        .ok_or_else(|| {
            ProcessingError::Permanent(format!(
                "no exception {} for tenant {}",
                envelope.exception_id, envelope.tenant_id
            ))
        })?;
    if row.current_stage != PipelineStage::Step || row.current_step != Some(step_order) {
        return Err(ProcessingError::StalePrecondition(format!(
            "tool request for step {step_order} but exception {} is at stage {} step {:?}",
            row.exception_id,
            row.current_stage.as_str(),
            row.current_step
        )));
    }

    let executor = ctx.tools.get(executor_kind).ok_or_else(|| {
        ProcessingError::Permanent(format!("no tool executor registered for `{executor_kind}`"))
    })?;

    let key = tool_executions::idempotency_key(envelope.exception_id, Some(step_order), &tool_id);
    let latest = tool_executions::latest_for_key(&ctx.pool, &key).await?;

    let execution = match latest {
        Some(existing) if existing.status == ToolExecutionStatus::Succeeded => {
            // Replay of a finished invocation: report the recorded outcome,
            // never run the effector twice.
            return emit_tool_completion(ctx, envelope, &existing, true).await;
        }
        Some(existing)
            if matches!(
                existing.status,
                ToolExecutionStatus::Requested | ToolExecutionStatus::Running
            ) =>
        {
            existing
        }
        other => {
            let attempt = other.map(|row| row.attempt + 1).unwrap_or(1);
            tool_executions::insert_attempt(
                &ctx.pool,
                NewToolExecution {
                    execution_id: Uuid::new_v4(),
                    tenant_id: &envelope.tenant_id,
                    exception_id: envelope.exception_id,
                    step_order: Some(step_order),
                    tool_id: &tool_id,
                    attempt,
                    requested_by_actor_type: "agent",
                    requested_by_actor_id: None,
                    input_payload: &input_payload,
                },
            )
            .await?
        }
    };

    tool_executions::mark_running(&ctx.pool, execution.execution_id).await?;

    let request = ToolRequest {
        tenant_id: envelope.tenant_id.clone(),
        exception_id: envelope.exception_id,
        step_order: Some(step_order),
        tool_id: tool_id.clone(),
        attempt: execution.attempt,
        input: input_payload,
        config: action_config,
    };

    match executor.execute(&request).await {
        Ok(ToolOutcome::Success { output }) => {
            tool_executions::complete(
                &ctx.pool,
                execution.execution_id,
                true,
                Some(&output),
                None,
            )
            .await?;
            let mut finished = execution;
            finished.output_payload = Some(output);
            finished.status = ToolExecutionStatus::Succeeded;
            emit_tool_completion(ctx, envelope, &finished, true).await
        }
        Ok(ToolOutcome::Failure { error }) => {
            tool_executions::complete(
                &ctx.pool,
                execution.execution_id,
                false,
                None,
                Some(&error),
            )
            .await?;
            let mut finished = execution;
            finished.error_message = Some(error);
            finished.status = ToolExecutionStatus::Failed;
            emit_tool_completion(ctx, envelope, &finished, false).await
        }
        Err(err) => {
            // Invocation never produced an outcome; record the dead attempt
            // and let the retry plane re-deliver the request.
            let message = err.to_string();
            tool_executions::complete(
                &ctx.pool,
                execution.execution_id,
                false,
                None,
                Some(&message),
            )
            .await?;
            Err(ProcessingError::Transient(message))
        }
    }
}

async fn emit_tool_completion(
    ctx: &WorkerContext,
    envelope: &EventEnvelope,
    execution: &tool_executions::ToolExecutionRow,
    success: bool,
) -> Result<(), ProcessingError> {
    let step_order = execution.step_order.unwrap_or(0);
    let mut outcome = HandlerOutcome::default();
    outcome.events.push(NewExceptionEvent::step_scoped(
        timeline::TOOL_COMPLETED,
        WorkerRole::Tool.as_str(),
        execution.attempt,
        step_order,
        json!({
            "execution_id": execution.execution_id,
            "tool_id": execution.tool_id,
            "success": success,
            "error": execution.error_message,
        }),
    ));
    outcome.outbound.push(handlers::OutboundMessage {
        topic: topics::TOOL_COMPLETED,
        envelope: handlers::outbound_envelope(
            envelope,
            event_types::TOOL_COMPLETED,
            WorkerRole::Tool,
            json!({
                "step_order": step_order,
                "execution_id": execution.execution_id,
                "tool_id": execution.tool_id,
                "success": success,
                "output": execution.output_payload,
                "error": execution.error_message,
            }),
        ),
    });

    commit(&ctx.pool, &envelope.tenant_id, envelope.exception_id, &outcome)
        .await
        .map_err(|err| match err {
            CommitError::Store(e) => ProcessingError::from(e),
            other => ProcessingError::Transient(other.to_string()),
        })
}

/// Classify-and-route failure policy: handlers never bubble errors past the
/// runtime. Transient failures re-enter through `control.retry`, permanent
/// and stale ones divert to `control.dlq`; every path leaves a timeline row.
async fn dispatch_failure(ctx: &WorkerContext, delivery: &Delivery, err: ProcessingError) {
    let kind = err.kind();
    let message = err.message();
    let envelope = &delivery.envelope;

    record_processing_error(ctx, delivery, kind, &message).await;

    let routed = match kind {
        ErrorKind::Transient | ErrorKind::ConfigMissing => {
            if ctx.retry_policy.attempts_exhausted(envelope.attempt) {
                warn!(
                    topic = %delivery.topic,
                    exception_id = %envelope.exception_id,
                    attempt = envelope.attempt,
                    %message,
                    "retry budget exhausted; diverting to DLQ"
                );
                divert_to_dlq(ctx, delivery, "RetriesExhausted", &message).await
            } else {
                retry::schedule(
                    ctx.broker.as_ref(),
                    &ctx.retry_policy,
                    &delivery.topic,
                    envelope,
                    kind.as_str(),
                    &message,
                )
                .await
            }
        }
        ErrorKind::Permanent => {
            error!(
                topic = %delivery.topic,
                exception_id = %envelope.exception_id,
                %message,
                "permanent failure; diverting to DLQ"
            );
            divert_to_dlq(ctx, delivery, kind.as_str(), &message).await
        }
        ErrorKind::StalePrecondition => {
            info!(
                topic = %delivery.topic,
                exception_id = %envelope.exception_id,
                %message,
                "stale precondition; acknowledged without mutation"
            );
            divert_to_dlq(ctx, delivery, "StalePrecondition", &message).await
        }
    };

    match routed {
        Ok(()) => {
            if let Err(ack_err) = ctx.broker.ack(delivery).await {
                warn!(?ack_err, "ack failed after failure routing");
            }
        }
        Err(route_err) => {
            error!(?route_err, "failure routing itself failed; releasing for redelivery");
            if let Err(release_err) = ctx.broker.release(delivery).await {
                warn!(?release_err, "release failed; lease will expire");
            }
        }
    }
}

async fn record_processing_error(
    ctx: &WorkerContext,
    delivery: &Delivery,
    kind: ErrorKind,
    message: &str,
) {
    let envelope = &delivery.envelope;
    let event = NewExceptionEvent::scoped(
        timeline::PROCESSING_ERROR,
        ctx.config.role.as_str(),
        envelope.attempt,
        &envelope.event_id.to_string(),
        json!({
            "kind": kind.as_str(),
            "message": message,
            "topic": delivery.topic,
            "event_type": envelope.event_type,
        }),
    );
    if let Err(err) =
        exception_events::insert(&ctx.pool, &envelope.tenant_id, envelope.exception_id, &event)
            .await
    {
        warn!(?err, "failed to record ProcessingError timeline row");
    }
}

async fn divert_to_dlq(
    ctx: &WorkerContext,
    delivery: &Delivery,
    reason: &str,
    error: &str,
) -> Result<(), crate::error::BrokerError> {
    let envelope = &delivery.envelope;
    let diversion = DlqDiversion {
        original_topic: delivery.topic.clone(),
        reason: reason.to_string(),
        error: error.to_string(),
        envelope: envelope.clone(),
    };
    let wrapper = EventEnvelope::new(
        event_types::DLQ_DIVERTED,
        &envelope.tenant_id,
        envelope.exception_id,
        "dlq",
        &envelope.correlation_id,
        serde_json::to_value(&diversion)?,
    );
    ctx.broker
        .publish(topics::CONTROL_DLQ, &wrapper.partition_key(), &wrapper)
        .await
}

/// Replay hook: re-publishes the most recent inbound envelope for an
/// exception on the given topic with a fresh attempt counter. Exposed for
/// operator tooling; intentionally has no HTTP surface.
pub async fn replay_exception(
    pool: &PgPool,
    broker: &dyn Broker,
    tenant_id: &str,
    exception_id: Uuid,
    topic: &str,
) -> anyhow::Result<bool> {
    let row = sqlx::query_scalar::<_, Value>(
        r#"
        SELECT envelope
        FROM event_log
        WHERE topic = $1 AND msg_key = $2
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(topic)
    .bind(exception_id.to_string())
    .fetch_optional(pool)
    .await?;

    let Some(body) = row else {
        return Ok(false);
    };
    let envelope: EventEnvelope = serde_json::from_value(body)?;
    if envelope.tenant_id != tenant_id {
        anyhow::bail!("envelope tenant does not match the requested tenant");
    }
    broker
        .publish(topic, &envelope.partition_key(), &envelope.with_attempt(1))
        .await?;
    Ok(true)
}

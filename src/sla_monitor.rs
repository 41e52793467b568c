use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::WorkerRole;
use crate::db::exception_events::{timeline, NewExceptionEvent};
use crate::db::exceptions::{self, ExceptionRow, ExceptionStatus, ExceptionUpdate, PipelineStage};
use crate::envelope::{event_types, topics, EventEnvelope};
use crate::handlers::{HandlerOutcome, OutboundMessage};
use crate::runtime::{commit, CommitError, Lifecycle, WorkerContext};

const MARKER_IMMINENT: &str = "imminent";
const MARKER_EXPIRED: &str = "expired";

/// How far ahead of now the deadline scan reaches. Bounds the candidate set;
/// per-pack imminent windows are applied row by row.
fn scan_horizon_minutes() -> i64 {
    std::env::var("SLA_SCAN_HORIZON_MINUTES")
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(60)
}

fn tick_seconds() -> u64 {
    std::env::var("SLA_TICK_SECONDS")
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(60)
        .max(1)
}

#[derive(Debug, Default)]
pub struct TickStats {
    pub imminent: usize,
    pub expired: usize,
    /// Tightest `resolution_seconds` among the packs of this tick's
    /// candidates; the next tick must not exceed it.
    pub min_resolution_seconds: Option<u64>,
}

/// Timer-driven producer of `sla.imminent`/`sla.expired`. Never consumes a
/// topic; every emission goes through the same transactional commit path as
/// the role handlers, so the dedup markers and the envelopes land together.
pub async fn run(
    ctx: Arc<WorkerContext>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    sqlx::query("SELECT 1").execute(&ctx.pool).await?;
    ctx.state.mark_store_ok();
    ctx.state.set(Lifecycle::Ready);

    // The tick never exceeds the tightest pack resolution seen on the
    // previous pass.
    let mut tick = Duration::from_secs(tick_seconds());
    info!(tick_seconds = tick_seconds(), "sla monitor ready");

    loop {
        tokio::select! {
            _ = time::sleep(tick) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }
        ctx.state.mark_running();
        match process_tick(&ctx, Utc::now()).await {
            Ok(stats) => {
                ctx.state.mark_store_ok();
                if stats.imminent > 0 || stats.expired > 0 {
                    info!(imminent = stats.imminent, expired = stats.expired, "sla tick emitted");
                }
                let ceiling = stats
                    .min_resolution_seconds
                    .map_or(tick_seconds(), |res| res.min(tick_seconds()));
                tick = Duration::from_secs(ceiling.max(1));
            }
            Err(err) => warn!(?err, "sla monitor tick failed"),
        }
    }

    ctx.state.set(Lifecycle::Stopped);
    Ok(())
}

pub async fn process_tick(ctx: &WorkerContext, now: DateTime<Utc>) -> anyhow::Result<TickStats> {
    let horizon = now + chrono::Duration::minutes(scan_horizon_minutes());
    let candidates = exceptions::sla_candidates(&ctx.pool, horizon, 500).await?;
    let mut stats = TickStats::default();

    for row in candidates {
        let Some(deadline) = row.sla_deadline else {
            continue;
        };
        let snapshot = match ctx.registry.snapshot(&row.tenant_id, &row.domain).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    tenant_id = %row.tenant_id,
                    exception_id = %row.exception_id,
                    ?err,
                    "skipping sla candidate without config snapshot"
                );
                continue;
            }
        };

        let resolution = snapshot.policy_pack.resolution_seconds.max(1);
        stats.min_resolution_seconds = Some(
            stats
                .min_resolution_seconds
                .map_or(resolution, |current| current.min(resolution)),
        );

        if deadline <= now {
            match expire(ctx, &row, deadline).await {
                Ok(true) => stats.expired += 1,
                Ok(false) => {}
                Err(err) => warn!(?err, exception_id = %row.exception_id, "sla expiry commit failed"),
            }
            continue;
        }

        let window =
            chrono::Duration::minutes(snapshot.policy_pack.imminent_window_minutes.max(0));
        if deadline - now <= window && row.last_sla_emitted.is_none() {
            match imminent(ctx, &row, deadline).await {
                Ok(true) => stats.imminent += 1,
                Ok(false) => {}
                Err(err) => warn!(?err, exception_id = %row.exception_id, "sla imminent commit failed"),
            }
        }
    }

    Ok(stats)
}

/// Emits `sla.expired` exactly once and escalates the exception. The
/// persisted marker plus the version CAS make a second emission impossible,
/// even with concurrent monitor replicas.
async fn expire(
    ctx: &WorkerContext,
    row: &ExceptionRow,
    deadline: DateTime<Utc>,
) -> Result<bool, anyhow::Error> {
    if row.last_sla_emitted.as_deref() == Some(MARKER_EXPIRED) {
        return Ok(false);
    }

    let mut update = ExceptionUpdate {
        last_sla_emitted: Some(MARKER_EXPIRED.to_string()),
        current_stage: Some(PipelineStage::Terminal),
        ..ExceptionUpdate::default()
    };
    if row.status != ExceptionStatus::Escalated {
        if !row.status.can_transition_to(ExceptionStatus::Escalated) {
            debug!(exception_id = %row.exception_id, status = ?row.status, "expired exception cannot escalate");
            return Ok(false);
        }
        update.status = Some(ExceptionStatus::Escalated);
    }

    let producer = WorkerRole::SlaMonitor.as_str();
    let mut outcome = HandlerOutcome {
        update: Some(update),
        expected_version: Some(row.version),
        ..HandlerOutcome::default()
    };
    outcome.events.push(NewExceptionEvent::system(
        timeline::SLA_EXPIRED,
        producer,
        1,
        json!({ "deadline": deadline }),
    ));
    outcome.events.push(NewExceptionEvent::system(
        timeline::EXCEPTION_ESCALATED,
        producer,
        1,
        json!({ "reason": "sla_expired", "deadline": deadline }),
    ));
    outcome.outbound.push(OutboundMessage {
        topic: topics::SLA_EXPIRED,
        envelope: monitor_envelope(row, event_types::SLA_EXPIRED, deadline),
    });

    apply(ctx, row, outcome).await
}

/// Emits `sla.imminent` once per armed deadline window.
async fn imminent(
    ctx: &WorkerContext,
    row: &ExceptionRow,
    deadline: DateTime<Utc>,
) -> Result<bool, anyhow::Error> {
    let update = ExceptionUpdate {
        last_sla_emitted: Some(MARKER_IMMINENT.to_string()),
        ..ExceptionUpdate::default()
    };
    let mut outcome = HandlerOutcome {
        update: Some(update),
        expected_version: Some(row.version),
        ..HandlerOutcome::default()
    };
    outcome.events.push(NewExceptionEvent::system(
        timeline::SLA_IMMINENT,
        WorkerRole::SlaMonitor.as_str(),
        1,
        json!({ "deadline": deadline }),
    ));
    outcome.outbound.push(OutboundMessage {
        topic: topics::SLA_IMMINENT,
        envelope: monitor_envelope(row, event_types::SLA_IMMINENT, deadline),
    });

    apply(ctx, row, outcome).await
}

async fn apply(
    ctx: &WorkerContext,
    row: &ExceptionRow,
    outcome: HandlerOutcome,
) -> Result<bool, anyhow::Error> {
    match commit(&ctx.pool, &row.tenant_id, row.exception_id, &outcome).await {
        Ok(()) => Ok(true),
        // Another writer moved the row; the next tick re-reads the marker.
        Err(CommitError::CasConflict) => Ok(false),
        Err(CommitError::Stale(message)) => {
            debug!(%message, "sla commit refused as stale");
            Ok(false)
        }
        Err(CommitError::Store(err)) => Err(err.into()),
    }
}

fn monitor_envelope(
    row: &ExceptionRow,
    event_type: &str,
    deadline: DateTime<Utc>,
) -> EventEnvelope {
    let correlation = row
        .correlation_id
        .clone()
        .unwrap_or_else(|| row.exception_id.to_string());
    EventEnvelope::new(
        event_type,
        &row.tenant_id,
        row.exception_id,
        WorkerRole::SlaMonitor.as_str(),
        &correlation,
        json!({ "deadline": deadline, "severity": row.severity }),
    )
}

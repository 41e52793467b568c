use std::sync::Arc;
use std::time::Duration;

use axum::{extract::Extension, http::StatusCode, routing::get, Json, Router};
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::debug;

use crate::config;
use crate::runtime::{Lifecycle, WorkerState};

fn lifecycle_name(lifecycle: Lifecycle) -> &'static str {
    match lifecycle {
        Lifecycle::Init => "init",
        Lifecycle::Ready => "ready",
        Lifecycle::Running => "running",
        Lifecycle::Draining => "draining",
        Lifecycle::Stopped => "stopped",
    }
}

/// Liveness: the process answers.
async fn healthz() -> &'static str {
    "ok"
}

/// Readiness: lifecycle is ready/running and the store answered recently.
async fn readyz(
    Extension(state): Extension<Arc<WorkerState>>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let lifecycle = lifecycle_name(state.get());
    let store_ok = state.store_ok_within(*config::READY_PROBE_SECONDS);
    if state.is_serving() && store_ok {
        Ok(Json(json!({ "status": "ready", "lifecycle": lifecycle })))
    } else {
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unavailable",
                "lifecycle": lifecycle,
                "store_ok": store_ok,
            })),
        ))
    }
}

pub fn router(state: Arc<WorkerState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(Extension(state))
}

/// Keeps the readiness probe honest while a worker is idle: pings the store
/// on half the probe interval and records the result.
pub fn spawn_store_pinger(
    pool: PgPool,
    state: Arc<WorkerState>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs((*config::READY_PROBE_SECONDS as u64 / 2).max(1));
        loop {
            if *shutdown.borrow() {
                break;
            }
            match sqlx::query("SELECT 1").execute(&pool).await {
                Ok(_) => state.mark_store_ok(),
                Err(err) => debug!(?err, "store ping failed"),
            }
            tokio::select! {
                _ = sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_always_answers() {
        let state = WorkerState::new();
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_refuses_before_ready() {
        let state = WorkerState::new();
        let app = router(state.clone());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/readyz")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn readyz_passes_once_serving_with_live_store() {
        let state = WorkerState::new();
        state.set(Lifecycle::Running);
        state.mark_store_ok();
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/readyz")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

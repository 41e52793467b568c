use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

use backend::broker::{Broker, PgBroker};
use backend::config::{WorkerConfig, WorkerRole};
use backend::registry::ConfigRegistry;
use backend::retry::RetryPolicy;
use backend::runtime::{Worker, WorkerContext, WorkerState};
use backend::tools::ToolExecutorRegistry;
use backend::{health, ingest, outbox, read_api, retry, sla_monitor};

#[tokio::main]
async fn main() {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
    dotenvy::dotenv().ok();

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "invalid worker configuration");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(config).await {
        tracing::error!(?err, "worker terminated abnormally");
        std::process::exit(2);
    }
}

async fn run(config: WorkerConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections((config.concurrency * 2 + 4) as u32)
        .connect(&config.store_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;

    // The shipped broker is Postgres-backed; a dedicated endpoint gets its
    // own pool, otherwise the store pool is shared.
    let broker_pool = if config.broker_url == config.store_url {
        pool.clone()
    } else {
        PgPoolOptions::new()
            .max_connections((config.concurrency * 2 + 4) as u32)
            .connect(&config.broker_url)
            .await?
    };
    let pg_broker = Arc::new(PgBroker::new(broker_pool));
    let broker: Arc<dyn Broker> = pg_broker.clone();

    let state = WorkerState::new();
    let registry = Arc::new(ConfigRegistry::new(pool.clone()));
    let ctx = Arc::new(WorkerContext {
        config: config.clone(),
        pool: pool.clone(),
        broker: broker.clone(),
        registry,
        tools: Arc::new(ToolExecutorRegistry::bootstrap()),
        retry_policy: RetryPolicy::for_role(config.role),
        state: state.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx);

    // Every process carries the outbox drainer and the retry plane; claims
    // are SKIP LOCKED so replicas cooperate instead of colliding.
    let _publisher = outbox::spawn_publisher(pool.clone(), broker.clone(), shutdown_rx.clone());
    if config.role != WorkerRole::Api {
        let _controller = retry::spawn_controller(
            pool.clone(),
            pg_broker.clone(),
            format!("retry-{}-{}", config.role, std::process::id()),
            shutdown_rx.clone(),
        );
        let _dispatcher = retry::spawn_dispatcher(pool.clone(), broker.clone(), shutdown_rx.clone());
    }
    let _pinger = health::spawn_store_pinger(pool.clone(), state.clone(), shutdown_rx.clone());

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let mut app = Router::new()
        .merge(health::router(state.clone()))
        .route(
            "/metrics",
            axum::routing::get(move || async move { metrics_handle.render() }),
        );
    if config.role == WorkerRole::Api {
        app = app
            .merge(ingest::router())
            .merge(read_api::router())
            .layer(axum::Extension(pool.clone()))
            .layer(axum::Extension(broker.clone()));
    }
    let app = app.layer(prometheus_layer);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.health_port).parse()?;
    let mut server_shutdown = shutdown_rx.clone();
    let server = axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        });
    tracing::info!(%addr, role = %config.role, "health endpoint listening");
    let server_handle = tokio::spawn(server);

    match config.role {
        WorkerRole::SlaMonitor => {
            sla_monitor::run(ctx, shutdown_rx.clone()).await?;
        }
        WorkerRole::Api => {
            use backend::runtime::Lifecycle;
            state.set(Lifecycle::Ready);
            let mut rx = shutdown_rx.clone();
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
            state.set(Lifecycle::Stopped);
        }
        _ => {
            Worker::new(ctx).run(shutdown_rx.clone()).await?;
        }
    }

    server_handle.abort();
    tracing::info!("clean shutdown");
    Ok(())
}

fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) {
    let _listener = tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    tracing::error!(?err, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("shutdown signal received; draining");
        let _ = shutdown_tx.send(true);
    });
}

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Router};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use traprunner::clock::SystemClock;
use traprunner::metrics::Metrics;
use traprunner::models::Config;
use traprunner::orchestrator::Orchestrator;

#[derive(Parser, Debug)]
#[command(name = "trader", version, about = "Greyhound wagering orchestrator")]
struct Cli {
    /// Bind address for health/readiness/metrics endpoints, overriding
    /// HTTP_BIND from the environment.
    #[arg(long, env = "HTTP_BIND")]
    http_bind: Option<String>,
}

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    metrics: Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(bind) = cli.http_bind {
        config.http_bind = bind;
    }

    traprunner::logging::init_tracing(config.tracing_enabled);

    let metrics = Metrics::install().context("installing metrics recorder")?;
    let orchestrator = Arc::new(
        Orchestrator::new(config.clone(), Arc::new(SystemClock), metrics.clone())
            .context("constructing orchestrator")?,
    );

    orchestrator.startup().await.context("orchestrator startup failed")?;

    let run_handle = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(Box::pin(async move { orchestrator.run().await }))
    };

    let state = AppState {
        orchestrator: orchestrator.clone(),
        metrics: metrics.clone(),
    };
    let health_app = Router::new()
        .route("/healthz", get(healthz))
        .route("/ready", get(readyz))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http());
    let metrics_app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(AppState { orchestrator: orchestrator.clone(), metrics })
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let health_listener = TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("binding health listener on {}", config.http_bind))?;
    let metrics_listener = TcpListener::bind(&config.metrics_bind)
        .await
        .with_context(|| format!("binding metrics listener on {}", config.metrics_bind))?;
    info!(health_addr = %config.http_bind, metrics_addr = %config.metrics_bind, "observability servers listening");

    let mut metrics_shutdown = orchestrator.shutdown_signal();
    let health_server = axum::serve(health_listener, health_app)
        .with_graceful_shutdown(shutdown_signal(orchestrator.clone()));
    let metrics_server = axum::serve(metrics_listener, metrics_app).with_graceful_shutdown(async move {
        let _ = metrics_shutdown.changed().await;
    });

    tokio::try_join!(
        async { health_server.await.context("health server error") },
        async { metrics_server.await.context("metrics server error") },
    )?;
    run_handle.await.context("orchestrator task panicked")??;
    Ok(())
}

async fn shutdown_signal(orchestrator: Arc<Orchestrator>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    orchestrator.request_shutdown();
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<AppState>) -> (axum::http::StatusCode, &'static str) {
    if state.orchestrator.is_ready() {
        (axum::http::StatusCode::OK, "ready")
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.render()
}

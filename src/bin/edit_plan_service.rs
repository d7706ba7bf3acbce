//! Edit Plan Service Binary
//!
//! Runs the job pipeline as a REST API service with production-grade features:
//! - Structured JSON logging for Cloud Logging
//! - Request tracing with correlation IDs
//! - Periodic recovery of interrupted jobs
//! - Graceful shutdown handling
//!
//! ## Configuration
//!
//! Environment variables:
//! - `DATABASE_URL`: PostgreSQL connection string (required)
//! - `DROP_DIR`: Directory the file-drop collaborators read and write (default: ./drop)
//! - `PORT`: Service port (default: 8002)
//! - `HOST`: Service host (default: 0.0.0.0)
//! - `RUST_LOG`: Log level filter (default: info)
//! - `LOG_FORMAT`: "json" for structured logs, "pretty" for development (default: json)
//! - `EDIT_PLAN_*`: Planner and pipeline tuning, see `EngineConfig::from_env`
//!
//! ## Usage
//!
//! ```bash
//! DATABASE_URL=postgresql://... DROP_DIR=/var/edit-plan cargo run --bin edit_plan_service --features service
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use edit_plan_kernel::service::{create_router, metrics_middleware, AppState, ServiceState};
use edit_plan_kernel::{
    BroadcastPublisher, Collaborators, EngineConfig, JobStateMachine, PostgresStore,
};

/// Initialize the tracing subscriber with JSON or pretty format
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "edit_plan_service=info,edit_plan=info,edit_plan_kernel=info,tower_http=info,sqlx=warn".into());

    if log_format == "pretty" {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE)
            )
            .init();
    } else {
        // Cloud Logging compatible
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .flatten_event(true)
            )
            .init();
    }
}

/// Request logging middleware that adds correlation ID and timing
async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();

    let trace_id = request
        .headers()
        .get("X-Cloud-Trace-Context")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split('/').next().unwrap_or(s).to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let method = request.method().clone();
    let uri = request.uri().path().to_string();

    let span = info_span!(
        "request",
        trace_id = %trace_id,
        method = %method,
        path = %uri,
        status = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );

    let response = next.run(request).instrument(span.clone()).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();

    span.record("status", status);
    span.record("latency_ms", latency.as_millis() as u64);

    info!(
        target: "edit_plan_service::access",
        trace_id = %trace_id,
        method = %method,
        path = %uri,
        status = status,
        latency_ms = latency.as_millis() as u64,
        "request completed"
    );

    response
}

/// Sweep for interrupted jobs once per staleness period, forever.
async fn recovery_loop(state: AppState) {
    let period = std::time::Duration::from_secs(state.machine.config().staleness_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        match state.machine.recover_interrupted().await {
            Ok(outcomes) => {
                for (job_id, outcome) in outcomes {
                    match outcome {
                        Ok(result) => info!(job_id = %job_id, result = ?result, "Recovered job"),
                        Err(e) => warn!(job_id = %job_id, error = %e, "Recovery failed"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "Recovery sweep failed"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let version = env!("CARGO_PKG_VERSION");
    let build_sha = option_env!("BUILD_SHA").unwrap_or("dev");

    info!(
        version = version,
        build_sha = build_sha,
        "Starting Edit Plan Service"
    );

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8002);

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let drop_dir = std::env::var("DROP_DIR").unwrap_or_else(|_| "./drop".to_string());

    let config = EngineConfig::from_env();
    if let Err(e) = config.planner.validate() {
        tracing::error!(error = %e, "Invalid planner configuration");
        return Err(e.into());
    }
    info!(
        planner_version = config.planner.planner_id(),
        params_hash = %config.planner.params_hash(),
        auto_resume = config.auto_resume,
        staleness_secs = config.staleness_secs,
        drop_dir = %drop_dir,
        "Engine configuration loaded"
    );

    // Connect to PostgreSQL with timeout
    info!("Connecting to PostgreSQL...");
    let connect_start = Instant::now();

    let store = match tokio::time::timeout(
        std::time::Duration::from_secs(30),
        PostgresStore::from_env()
    ).await {
        Ok(Ok(store)) => store,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            return Err(e.into());
        }
        Err(_) => {
            tracing::error!("PostgreSQL connection timeout after 30s");
            return Err("Database connection timeout".into());
        }
    };
    store.migrate().await?;

    info!(
        latency_ms = connect_start.elapsed().as_millis() as u64,
        "PostgreSQL connection established"
    );

    let progress = Arc::new(BroadcastPublisher::new(config.progress_capacity));
    let machine = JobStateMachine::new(
        Arc::new(store),
        progress.clone(),
        Collaborators::file_drop(drop_dir),
        config,
    );
    let state: AppState = ServiceState::new(machine, progress);

    let recovery = tokio::spawn(recovery_loop(state.clone()));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!(
        address = %addr,
        version = version,
        "Edit Plan Service listening"
    );

    let listener = TcpListener::bind(addr).await?;

    info!("Ready to accept connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    recovery.abort();
    info!("Edit Plan Service shutdown complete");

    Ok(())
}

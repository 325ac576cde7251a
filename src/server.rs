use axum::routing::{get, post};
use axum::{middleware, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::engine::SynthesisEngine;
use crate::handlers::{
    enqueue_batch, enqueue_job, get_job, health_check, list_dead_letters, metrics, pause,
    readiness_check, resume, AppState, SharedState,
};
use crate::middleware::logging_middleware;

/// Build the HTTP surface over an engine.
pub fn create_app(engine: Arc<SynthesisEngine>) -> Router {
    let state: SharedState = Arc::new(AppState::new(engine));

    Router::new()
        // Job endpoints
        .route("/jobs", post(enqueue_job))
        .route("/jobs/batch", post(enqueue_batch))
        .route("/jobs/dead", get(list_dead_letters))
        .route("/jobs/:id", get(get_job))
        // Pool control
        .route("/admin/pause", post(pause))
        .route("/admin/resume", post(resume))
        // Observability
        .route("/metrics", get(metrics))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
}

impl Server {
    pub fn new(engine: Arc<SynthesisEngine>, bind_addr: SocketAddr) -> Self {
        Self {
            app: create_app(engine),
            bind_addr,
        }
    }

    /// Serve until `shutdown` resolves, then stop accepting connections.
    pub async fn run<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("Synthesis server listening on {}", self.bind_addr);
        tracing::info!("Health check available at /health");
        tracing::info!("Metrics available at /metrics");

        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}

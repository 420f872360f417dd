//! HTTP routes.

use std::path::Path;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde::Serialize;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::metrics::{MetricsSnapshot, SessionMetrics};

use super::auth::{JwtChecker, TokenChecker};
use super::shell;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Capability used to authenticate shell sessions
    pub tokens: Arc<dyn TokenChecker>,
    /// Session counters
    pub metrics: Arc<SessionMetrics>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let tokens: Arc<dyn TokenChecker> = Arc::new(JwtChecker::new(&config.jwt));
        Self {
            config,
            tokens,
            metrics: Arc::new(SessionMetrics::default()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    #[serde(flatten)]
    pub sessions: MetricsSnapshot,
}

pub fn router(state: Arc<AppState>) -> Router {
    let app = Router::new()
        .route("/health", get(health))
        .route("/readiness", get(readiness))
        // Browsers cannot set headers on websocket requests, so the token rides in the query.
        .route("/goshell", get(shell::shell_ws));

    let app = match static_files(&state.config.web_root) {
        Some(files) => app.fallback_service(files),
        None => {
            tracing::warn!(
                web_root = %state.config.web_root.display(),
                "Web root not found, browser terminal will not be served"
            );
            app
        }
    };

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serve the browser terminal from `web_root`, if it exists.
fn static_files(web_root: &Path) -> Option<ServeDir<ServeFile>> {
    if !web_root.is_dir() {
        return None;
    }
    Some(
        ServeDir::new(web_root)
            .append_index_html_on_directories(true)
            .fallback(ServeFile::new(web_root.join("index.html"))),
    )
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!(
        command = %config.shell.command,
        allowed_hosts = ?config.shell.allowed_hostnames,
        keepalive_secs = config.shell.keepalive_ping_timeout.as_secs(),
        web_root = %config.web_root.display(),
        "Shell endpoint configured"
    );

    let state = Arc::new(AppState::new(config));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

async fn readiness() -> StatusCode {
    StatusCode::OK
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions: state.metrics.snapshot(),
    })
}

//! WebSocket endpoint that attaches a browser terminal to a shell on this host.
//!
//! The request's `Host` must be in the configured allow-list before the
//! upgrade happens. Authentication comes after the upgrade, so a bad token
//! is reported as a text frame rather than an HTTP status.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use tracing::Instrument;
use uuid::Uuid;

use super::origin::is_host_allowed;
use super::routes::AppState;
use crate::session::serve_connection;

#[derive(Debug, Default, Deserialize)]
pub struct ShellParams {
    /// Bearer token (JWT)
    pub token: Option<String>,
}

/// Admission check run before the upgrade.
pub fn admit(headers: &HeaderMap, allowed: &[String]) -> Result<(), StatusCode> {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if is_host_allowed(host, allowed) {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

pub async fn shell_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ShellParams>,
    headers: HeaderMap,
) -> Response {
    let cfg = &state.config.shell;
    if let Err(status) = admit(&headers, &cfg.allowed_hostnames) {
        state.metrics.rejected();
        return (status, "Origin not allowed").into_response();
    }

    let upgrade = ws
        .write_buffer_size(cfg.max_buffer_size_bytes)
        .max_message_size(cfg.max_message_size_bytes)
        .max_frame_size(cfg.max_message_size_bytes)
        .on_failed_upgrade(|e| tracing::warn!(error = %e, "Failed to upgrade connection"));

    let state = Arc::clone(&state);
    upgrade
        .on_upgrade(move |socket| handle_shell(socket, state, params.token))
        .into_response()
}

async fn handle_shell(socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    let id = Uuid::new_v4();
    let span = tracing::info_span!("shell_session", session_id = %id);

    async move {
        tracing::info!("Established websocket connection");
        let (sink, stream) = socket.split();
        let outcome = serve_connection(
            id,
            sink,
            stream,
            &state.config.shell,
            token.as_deref(),
            state.tokens.as_ref(),
            &state.metrics,
        )
        .await;
        tracing::info!(outcome = ?outcome, "Connection finished");
    }
    .instrument(span)
    .await
}

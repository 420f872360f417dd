//! Keepalive and token expiry checks.
//!
//! Every half keepalive interval the monitor pings the client, then checks
//! that a pong arrived within the full interval and that the caller's token
//! is still valid. Pongs are recorded by the inbound bridge through
//! [`Liveness::touch`].

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::Message;
use chrono::Utc;
use futures::Sink;
use tokio::time::Instant;

use super::connection::ConnectionWriter;
use super::{Shutdown, TerminationCause};
use crate::api::auth::Claims;

const PING_PAYLOAD: &[u8] = b"keepalive";

/// Time of the most recent pong, shared between the inbound bridge and the monitor.
pub struct Liveness {
    origin: Instant,
    last_pong_ms: AtomicU64,
}

impl Liveness {
    /// Starts as if a pong had just been received.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_pong_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_pong_ms.fetch_max(now, Ordering::AcqRel);
    }

    pub fn since_last_pong(&self) -> Duration {
        let last = Duration::from_millis(self.last_pong_ms.load(Ordering::Acquire));
        self.origin.elapsed().saturating_sub(last)
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the monitor loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// Another task ended the session.
    Stopped,
    /// The ping could not be written.
    ProbeFailed,
    /// No pong within the keepalive interval.
    TimedOut,
    /// The token is no longer valid.
    Expired,
}

pub async fn run_monitor<S>(
    conn: &ConnectionWriter<S>,
    liveness: &Liveness,
    claims: &Claims,
    keepalive: Duration,
    shutdown: &Shutdown,
) -> MonitorExit
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    let half = keepalive / 2;
    let cancelled = shutdown.token();

    loop {
        // A peer that stops reading never lets the ping out; give up after half an interval.
        let ping = conn.send(Message::Ping(PING_PAYLOAD.to_vec()));
        let sent = tokio::select! {
            biased;
            _ = cancelled.cancelled() => return MonitorExit::Stopped,
            sent = tokio::time::timeout(half, ping) => sent,
        };
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to write ping message");
                shutdown.trigger(TerminationCause::ProbeFailed);
                return MonitorExit::ProbeFailed;
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = half.as_millis() as u64,
                    "Timed out writing ping message"
                );
                shutdown.trigger(TerminationCause::ProbeFailed);
                return MonitorExit::ProbeFailed;
            }
        }

        tokio::select! {
            biased;
            _ = cancelled.cancelled() => return MonitorExit::Stopped,
            _ = tokio::time::sleep(half) => {}
        }

        let silent = liveness.since_last_pong();
        if silent > keepalive {
            tracing::warn!(
                silent_ms = silent.as_millis() as u64,
                "No response to ping, triggering disconnect"
            );
            shutdown.trigger(TerminationCause::PingTimeout);
            return MonitorExit::TimedOut;
        }
        tracing::debug!("Received response from ping");

        if !claims.is_valid_at(Utc::now()) {
            tracing::warn!(
                subject = %claims.subject,
                expired_at = %claims.expires_at,
                "Token has expired, triggering disconnect"
            );
            conn.farewell(TerminationCause::TokenExpired.close_reason())
                .await;
            shutdown.trigger(TerminationCause::TokenExpired);
            return MonitorExit::Expired;
        }
        tracing::debug!(expires_at = %claims.expires_at, "Token still valid");
    }
}

//! One shell session per upgraded WebSocket.
//!
//! [`serve_connection`] spawns the configured command on a PTY, checks the
//! caller's token and then runs three tasks side by side: the keepalive
//! monitor and one byte pump per direction. The first task to hit a fatal
//! condition records it in a [`Shutdown`] and everybody else stops; teardown
//! then kills and reaps the child, closes the PTY and finally the connection.

pub mod bridge;
pub mod connection;
pub mod monitor;
pub mod resize;

use std::fmt::{self, Display};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, Stream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::auth::{redact, Claims, TokenChecker};
use crate::config::ShellConfig;
use crate::metrics::SessionMetrics;
use crate::pty::PtyHandle;

use self::bridge::{drive_pty_input, pump_input, pump_output, read_pty_output, PtyInput};
use self::connection::ConnectionWriter;
use self::monitor::{run_monitor, Liveness};

/// How long tasks get to notice the stop signal before they are aborted.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Window size used until the client sends its first resize.
const INITIAL_ROWS: u16 = 24;
const INITIAL_COLS: u16 = 80;

const OUTPUT_QUEUE: usize = 32;
const INPUT_QUEUE: usize = 64;

/// The fatal condition that ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationCause {
    /// The child closed its side of the PTY.
    ProcessExited,
    /// Reading process output failed.
    PtyReadFailed,
    /// Reading from the client failed.
    ConnectionReadFailed,
    /// Too many consecutive writes to the client failed.
    WriteExhausted,
    /// A keepalive ping could not be sent.
    ProbeFailed,
    /// The client stopped answering pings.
    PingTimeout,
    /// The caller's token expired mid-session.
    TokenExpired,
    /// The client closed the connection.
    ClientClosed,
}

impl TerminationCause {
    pub const ALL: [TerminationCause; 8] = [
        TerminationCause::ProcessExited,
        TerminationCause::PtyReadFailed,
        TerminationCause::ConnectionReadFailed,
        TerminationCause::WriteExhausted,
        TerminationCause::ProbeFailed,
        TerminationCause::PingTimeout,
        TerminationCause::TokenExpired,
        TerminationCause::ClientClosed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessExited => "process_exited",
            Self::PtyReadFailed => "pty_read_failed",
            Self::ConnectionReadFailed => "connection_read_failed",
            Self::WriteExhausted => "write_exhausted",
            Self::ProbeFailed => "probe_failed",
            Self::PingTimeout => "ping_timeout",
            Self::TokenExpired => "token_expired",
            Self::ClientClosed => "client_closed",
        }
    }

    /// Human readable reason included in the closing notice, if any.
    pub fn close_reason(&self) -> Option<&'static str> {
        match self {
            Self::TokenExpired => Some("token has expired"),
            Self::PingTimeout => Some("ping timeout"),
            Self::WriteExhausted => Some("connection error limit reached"),
            _ => None,
        }
    }
}

impl Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-shot stop signal carrying the first termination cause.
pub struct Shutdown {
    cause: OnceLock<TerminationCause>,
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            cause: OnceLock::new(),
            token: CancellationToken::new(),
        }
    }

    /// Record `cause` and stop every task. Returns true only for the first
    /// caller; later causes are dropped.
    pub fn trigger(&self, cause: TerminationCause) -> bool {
        let first = self.cause.set(cause).is_ok();
        if first {
            tracing::info!(cause = %cause, "Session ending");
        } else {
            tracing::debug!(cause = %cause, "Session already ending, ignoring");
        }
        self.token.cancel();
        first
    }

    pub fn cause(&self) -> Option<TerminationCause> {
        self.cause.get().copied()
    }

    pub fn close_reason(&self) -> Option<&'static str> {
        self.cause().and_then(|c| c.close_reason())
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Wait for the first cause.
    pub async fn triggered(&self) -> TerminationCause {
        self.token.cancelled().await;
        // The cause is always stored before the token is cancelled.
        self.cause().unwrap_or(TerminationCause::ClientClosed)
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// An authenticated session about to start.
pub struct Session {
    pub id: Uuid,
    pub config: ShellConfig,
    pub claims: Claims,
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The command could not be started.
    SpawnFailed,
    /// The token was missing or invalid.
    AuthFailed,
    /// The session ran and ended for the given reason.
    Terminated(TerminationCause),
}

/// Drive one upgraded connection from spawn to teardown.
pub async fn serve_connection<S, R, E>(
    id: Uuid,
    sink: S,
    stream: R,
    config: &ShellConfig,
    token: Option<&str>,
    checker: &dyn TokenChecker,
    metrics: &SessionMetrics,
) -> SessionOutcome
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let conn = ConnectionWriter::new(sink);

    tracing::info!(
        command = %config.command,
        args = ?config.arguments,
        "Starting tty"
    );
    let pty = match PtyHandle::spawn(&config.command, &config.arguments, INITIAL_ROWS, INITIAL_COLS)
    {
        Ok(pty) => pty,
        Err(e) => {
            let message = format!("failed to start tty: {}", e);
            tracing::warn!("{}", message);
            if let Err(e) = conn.send_text(message).await {
                tracing::warn!(error = %e, "Failed to send error message to client");
            }
            conn.close().await;
            metrics.rejected();
            return SessionOutcome::SpawnFailed;
        }
    };

    let token = token.unwrap_or_default();
    let claims = match checker.parse_token(token) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::warn!(token = %redact(token), error = %e, "Failed to parse token");
            if let Err(e) = conn.send_text("failed to parse JWT token").await {
                tracing::warn!(error = %e, "Failed to send error message to client");
            }
            release_pty(pty).await;
            conn.close().await;
            metrics.rejected();
            return SessionOutcome::AuthFailed;
        }
    };
    tracing::info!(subject = %claims.subject, username = %claims.username, "Token accepted");

    let session = Session {
        id,
        config: config.clone(),
        claims,
    };
    SessionOutcome::Terminated(run_session(session, pty, conn, stream, metrics).await)
}

/// Run an authenticated session until its first fatal condition and tear it down.
pub async fn run_session<S, R, E>(
    session: Session,
    pty: PtyHandle,
    conn: ConnectionWriter<S>,
    stream: R,
    metrics: &SessionMetrics,
) -> TerminationCause
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let conn = Arc::new(conn);
    let shutdown = Arc::new(Shutdown::new());
    let liveness = Arc::new(Liveness::new());
    let config = session.config;

    let io = pty.reader().and_then(|r| pty.writer().map(|w| (r, w)));
    let (reader, writer) = match io {
        Ok(io) => io,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to attach to tty");
            shutdown.trigger(TerminationCause::PtyReadFailed);
            teardown(pty, &conn, shutdown.close_reason()).await;
            return TerminationCause::PtyReadFailed;
        }
    };

    metrics.session_started();
    tracing::info!(
        session_id = %session.id,
        pid = ?pty.process_id(),
        keepalive_secs = config.keepalive_ping_timeout.as_secs(),
        "Shell session running"
    );

    let (out_tx, out_rx) = mpsc::channel(OUTPUT_QUEUE);
    let buffer_size = config.max_buffer_size_bytes;
    tokio::task::spawn_blocking(move || read_pty_output(reader, buffer_size, out_tx));

    let (in_tx, in_rx) = mpsc::channel::<PtyInput>(INPUT_QUEUE);
    let resizer = pty.resizer();
    tokio::task::spawn_blocking(move || drive_pty_input(in_rx, writer, &resizer));

    let tasks = vec![
        tokio::spawn({
            let conn = Arc::clone(&conn);
            let liveness = Arc::clone(&liveness);
            let shutdown = Arc::clone(&shutdown);
            let claims = session.claims;
            let keepalive = config.keepalive_ping_timeout;
            async move {
                let exit = run_monitor(&conn, &liveness, &claims, keepalive, &shutdown).await;
                tracing::debug!(exit = ?exit, "Keepalive monitor exiting");
            }
        }),
        tokio::spawn({
            let conn = Arc::clone(&conn);
            let shutdown = Arc::clone(&shutdown);
            let limit = config.connection_error_limit;
            async move { pump_output(out_rx, &conn, limit, &shutdown).await }
        }),
        tokio::spawn({
            let liveness = Arc::clone(&liveness);
            let shutdown = Arc::clone(&shutdown);
            async move { pump_input(stream, in_tx, &liveness, &shutdown).await }
        }),
    ];

    let cause = shutdown.triggered().await;
    tracing::info!(cause = %cause, "Stopping session tasks");

    let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
    if tokio::time::timeout(STOP_GRACE, futures::future::join_all(tasks))
        .await
        .is_err()
    {
        tracing::warn!("Session tasks did not stop in time, aborting");
        for handle in aborts {
            handle.abort();
        }
    }

    teardown(pty, &conn, cause.close_reason()).await;
    metrics.session_ended(cause);
    tracing::info!(cause = %cause, "Shell session closed");
    cause
}

/// Kill and reap the child, close the PTY, then say goodbye and close the
/// connection. Every step runs even if an earlier one failed, and the
/// connection steps are time-bounded.
async fn teardown<S>(pty: PtyHandle, conn: &ConnectionWriter<S>, reason: Option<&str>)
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    tracing::info!("Stopping spawned tty");
    release_pty(pty).await;
    conn.farewell(reason).await;
    conn.close().await;
    tracing::info!("Tty and connection closed");
}

async fn release_pty(pty: PtyHandle) {
    let released = tokio::task::spawn_blocking(move || {
        let mut pty = pty;
        pty.terminate();
        if !pty.close() {
            tracing::warn!("PTY was already closed");
        }
    })
    .await;
    if let Err(e) = released {
        tracing::warn!(error = %e, "Failed to release tty");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::api::auth::tests::{mint, test_config};
    use crate::api::auth::JwtChecker;
    use crate::session::connection::tests::{ScriptedSink, StalledSink};
    use chrono::Utc;
    use std::sync::atomic::Ordering;
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;

    #[test]
    fn test_first_cause_wins() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        assert!(shutdown.trigger(TerminationCause::PingTimeout));
        assert!(!shutdown.trigger(TerminationCause::PtyReadFailed));
        assert!(shutdown.is_triggered());
        assert_eq!(shutdown.cause(), Some(TerminationCause::PingTimeout));
        assert_eq!(shutdown.close_reason(), Some("ping timeout"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_triggers_record_one_cause() {
        let shutdown = Arc::new(Shutdown::new());
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let racers: Vec<_> = [TerminationCause::PtyReadFailed, TerminationCause::PingTimeout]
            .into_iter()
            .map(|cause| {
                let shutdown = Arc::clone(&shutdown);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    shutdown.trigger(cause)
                })
            })
            .collect();

        let mut winners = 0;
        for racer in racers {
            if racer.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        let cause = shutdown.triggered().await;
        assert!(matches!(
            cause,
            TerminationCause::PtyReadFailed | TerminationCause::PingTimeout
        ));
    }

    fn cat_config() -> ShellConfig {
        ShellConfig {
            command: "/bin/cat".to_string(),
            keepalive_ping_timeout: Duration::from_secs(60),
            ..Default::default()
        }
        .normalized()
    }

    fn valid_token() -> String {
        let now = Utc::now().timestamp();
        mint(&test_config(), now, now + 3600)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_round_trip_through_real_pty() {
        let (out_tx, mut out_rx) = fmpsc::unbounded::<Message>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<Message, String>>();
        let checker = JwtChecker::new(&test_config());
        let metrics = Arc::new(SessionMetrics::default());
        let token = valid_token();

        let session = tokio::spawn({
            let metrics = Arc::clone(&metrics);
            async move {
                serve_connection(
                    Uuid::new_v4(),
                    out_tx,
                    in_rx,
                    &cat_config(),
                    Some(token.as_str()),
                    &checker,
                    &metrics,
                )
                .await
            }
        });

        in_tx
            .unbounded_send(Ok(Message::Binary(b"abc".to_vec())))
            .unwrap();

        let mut output = Vec::new();
        let seen = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(msg) = out_rx.next().await {
                if let Message::Binary(data) = msg {
                    output.extend_from_slice(&data);
                    if output.windows(3).any(|w| w == b"abc") {
                        return true;
                    }
                }
            }
            false
        })
        .await;
        assert_eq!(seen, Ok(true), "output so far: {:?}", output);
        assert_eq!(metrics.snapshot().active_sessions, 1);

        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(10), session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::Terminated(TerminationCause::ClientClosed)
        );

        // Closing notice, then the sink is closed.
        let rest: Vec<Message> = out_rx.collect().await;
        assert!(rest
            .iter()
            .any(|m| matches!(m, Message::Text(t) if t.starts_with("server is closing connection"))));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_sessions, 0);
        assert_eq!(snapshot.total_sessions, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_process_exit_ends_session() {
        let (out_tx, out_rx) = fmpsc::unbounded::<Message>();
        let (_in_tx, in_rx) = fmpsc::unbounded::<Result<Message, String>>();
        let checker = JwtChecker::new(&test_config());
        let metrics = SessionMetrics::default();
        let config = ShellConfig {
            command: "/bin/echo".to_string(),
            arguments: vec!["bye".to_string()],
            ..cat_config()
        };

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            serve_connection(
                Uuid::new_v4(),
                out_tx,
                in_rx,
                &config,
                Some(valid_token().as_str()),
                &checker,
                &metrics,
            ),
        )
        .await
        .unwrap();

        assert_eq!(
            outcome,
            SessionOutcome::Terminated(TerminationCause::ProcessExited)
        );
        let frames: Vec<Message> = out_rx.collect().await;
        let text: Vec<u8> = frames
            .iter()
            .filter_map(|m| match m {
                Message::Binary(b) => Some(b.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert!(String::from_utf8_lossy(&text).contains("bye"));
    }

    #[tokio::test]
    async fn test_bad_token_is_rejected_before_session_starts() {
        let (out_tx, out_rx) = fmpsc::unbounded::<Message>();
        let (_in_tx, in_rx) = fmpsc::unbounded::<Result<Message, String>>();
        let checker = JwtChecker::new(&test_config());
        let metrics = SessionMetrics::default();

        let outcome = serve_connection(
            Uuid::new_v4(),
            out_tx,
            in_rx,
            &cat_config(),
            Some("garbage"),
            &checker,
            &metrics,
        )
        .await;

        assert_eq!(outcome, SessionOutcome::AuthFailed);
        let frames: Vec<Message> = out_rx.collect().await;
        assert!(matches!(&frames[0], Message::Text(t) if t == "failed to parse JWT token"));
        assert!(!frames.iter().any(|m| matches!(m, Message::Binary(_))));
        assert_eq!(metrics.snapshot().total_sessions, 0);
        assert_eq!(metrics.snapshot().rejected_connections, 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported_to_client() {
        let (out_tx, out_rx) = fmpsc::unbounded::<Message>();
        let (_in_tx, in_rx) = fmpsc::unbounded::<Result<Message, String>>();
        let checker = JwtChecker::new(&test_config());
        let metrics = SessionMetrics::default();
        let config = ShellConfig {
            command: "/no/such/shell".to_string(),
            ..cat_config()
        };

        let outcome = serve_connection(
            Uuid::new_v4(),
            out_tx,
            in_rx,
            &config,
            Some(valid_token().as_str()),
            &checker,
            &metrics,
        )
        .await;

        assert_eq!(outcome, SessionOutcome::SpawnFailed);
        let frames: Vec<Message> = out_rx.collect().await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], Message::Text(t) if t.starts_with("failed to start tty")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stalled_client_does_not_hang_teardown() {
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<Message, String>>();
        let checker = JwtChecker::new(&test_config());
        let metrics = SessionMetrics::default();
        let token = valid_token();

        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            serve_connection(
                Uuid::new_v4(),
                StalledSink,
                in_rx,
                &cat_config(),
                Some(token.as_str()),
                &checker,
                &metrics,
            ),
        )
        .await
        .expect("session must finish even if the client stopped reading");

        assert_eq!(
            outcome,
            SessionOutcome::Terminated(TerminationCause::ClientClosed)
        );
        assert_eq!(metrics.snapshot().active_sessions, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_simultaneous_failures_tear_down_once() {
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<Message, String>>();
        let sink = ScriptedSink::new([]);
        let sent = Arc::clone(&sink.sent);
        let closes = Arc::clone(&sink.closes);
        let metrics = SessionMetrics::default();

        let config = ShellConfig {
            keepalive_ping_timeout: Duration::from_secs(2),
            ..cat_config()
        };
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            config,
            // Already expired: the monitor ends the session on its first check.
            claims: Claims {
                subject: "42".to_string(),
                username: "goadmin".to_string(),
                issued_at: now - chrono::Duration::hours(2),
                expires_at: now - chrono::Duration::hours(1),
            },
        };
        let pty = PtyHandle::spawn("/bin/cat", &[], INITIAL_ROWS, INITIAL_COLS).unwrap();

        // The client connection breaks at the same moment the token check runs.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = in_tx.unbounded_send(Err("connection reset".to_string()));
        });

        let cause = tokio::time::timeout(
            Duration::from_secs(10),
            run_session(session, pty, ConnectionWriter::new(sink), in_rx, &metrics),
        )
        .await
        .unwrap();

        assert!(matches!(
            cause,
            TerminationCause::TokenExpired | TerminationCause::ConnectionReadFailed
        ));
        let notices = sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| matches!(m, Message::Text(t) if t.starts_with("server is closing connection")))
            .count();
        assert_eq!(notices, 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let ended: u64 = metrics.snapshot().terminations.iter().map(|t| t.count).sum();
        assert_eq!(ended, 1);
    }
}

//! Byte pumps between the PTY and the WebSocket.
//!
//! PTY reads and writes block, so each side has a blocking half running on
//! tokio's blocking pool and an async half talking to the connection. The two
//! halves are joined by bounded channels, which keeps bytes in order within
//! each direction.

use std::fmt::Display;
use std::io::{self, ErrorKind, Read, Write};

use axum::extract::ws::Message;
use futures::{Sink, Stream, StreamExt};
use tokio::sync::mpsc;

use super::connection::ConnectionWriter;
use super::monitor::Liveness;
use super::resize::{is_resize_frame, parse_resize, trim_nul};
use super::{Shutdown, TerminationCause};
use crate::pty::Resize;

/// Linux reports EIO on the PTY master once the child side is gone.
const EIO: i32 = 5;

/// Work for the blocking PTY writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyInput {
    Data(Vec<u8>),
    Resize { rows: u16, cols: u16 },
}

/// Blocking loop: read process output in chunks of at most `buffer_size`
/// bytes and hand them to the outbound pump.
///
/// End of file (or EIO from an exited child) closes the channel; any other
/// error is forwarded once before closing.
pub fn read_pty_output<R: Read>(
    mut reader: R,
    buffer_size: usize,
    tx: mpsc::Sender<io::Result<Vec<u8>>>,
) {
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.raw_os_error() == Some(EIO) => break,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                break;
            }
        }
    }
    tracing::debug!("PTY reader exiting");
}

/// Send process output to the client as binary frames.
///
/// A failed PTY read ends the session. Failed writes are tolerated until
/// more than `error_limit` of them happen in a row.
pub async fn pump_output<S>(
    mut rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    conn: &ConnectionWriter<S>,
    error_limit: usize,
    shutdown: &Shutdown,
) where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    let cancelled = shutdown.token();
    let mut consecutive_errors = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancelled.cancelled() => break,
            next = rx.recv() => next,
        };

        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Failed to read from tty");
                conn.farewell(shutdown.close_reason()).await;
                shutdown.trigger(TerminationCause::PtyReadFailed);
                break;
            }
            None => {
                tracing::info!("Process output closed");
                conn.farewell(shutdown.close_reason()).await;
                shutdown.trigger(TerminationCause::ProcessExited);
                break;
            }
        };

        let len = chunk.len();
        let sent = tokio::select! {
            biased;
            _ = cancelled.cancelled() => break,
            sent = conn.send(Message::Binary(chunk)) => sent,
        };
        match sent {
            Ok(()) => {
                consecutive_errors = 0;
                tracing::trace!(bytes = len, "Sent tty output to client");
            }
            Err(e) => {
                consecutive_errors += 1;
                tracing::warn!(
                    bytes = len,
                    consecutive_errors,
                    error = %e,
                    "Failed to send tty output to client"
                );
                if consecutive_errors > error_limit {
                    tracing::warn!(error_limit, "Connection error limit reached");
                    shutdown.trigger(TerminationCause::WriteExhausted);
                    break;
                }
            }
        }
    }
    tracing::debug!("Outbound pump exiting");
}

/// Translate one client frame into PTY work. Returns `None` for frames that
/// carry nothing to do, including resize requests that fail to parse.
pub fn decode_frame(data: &[u8], binary: bool) -> Option<PtyInput> {
    let data = trim_nul(data);
    if data.is_empty() {
        return None;
    }
    if binary && is_resize_frame(data) {
        return match parse_resize(&data[1..]) {
            Ok(size) => {
                tracing::debug!(rows = size.rows, cols = size.cols, "Resize requested");
                Some(PtyInput::Resize {
                    rows: size.rows,
                    cols: size.cols,
                })
            }
            Err(e) => {
                tracing::warn!(
                    payload = %String::from_utf8_lossy(&data[1..]),
                    error = %e,
                    "Ignoring resize message"
                );
                None
            }
        };
    }
    Some(PtyInput::Data(data.to_vec()))
}

/// Read client frames and forward keystrokes and resizes to the PTY writer.
///
/// Pongs refresh `liveness`. A read error or the client going away ends the
/// session; bad frames are dropped.
pub async fn pump_input<R, E>(
    mut stream: R,
    tx: mpsc::Sender<PtyInput>,
    liveness: &Liveness,
    shutdown: &Shutdown,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let cancelled = shutdown.token();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancelled.cancelled() => break,
            next = stream.next() => next,
        };

        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Failed to read from client");
                shutdown.trigger(TerminationCause::ConnectionReadFailed);
                break;
            }
            None => {
                tracing::info!("Client connection ended");
                shutdown.trigger(TerminationCause::ClientClosed);
                break;
            }
        };

        let input = match msg {
            Message::Binary(data) => decode_frame(&data, true),
            Message::Text(text) => decode_frame(text.as_bytes(), false),
            Message::Pong(_) => {
                liveness.touch();
                None
            }
            // Pings are answered by the websocket layer.
            Message::Ping(_) => None,
            Message::Close(frame) => {
                tracing::info!(frame = ?frame, "Client closed connection");
                shutdown.trigger(TerminationCause::ClientClosed);
                break;
            }
        };

        if let Some(input) = input {
            let delivered = tokio::select! {
                biased;
                _ = cancelled.cancelled() => break,
                delivered = tx.send(input) => delivered,
            };
            if delivered.is_err() {
                tracing::warn!("PTY writer is gone, dropping client input");
            }
        }
    }
    tracing::debug!("Inbound pump exiting");
}

/// Blocking loop applying client input to the PTY. Failures are logged and
/// the offending frame dropped. Returns once every sender is gone.
pub fn drive_pty_input<W: Write>(
    mut rx: mpsc::Receiver<PtyInput>,
    mut writer: W,
    resizer: &dyn Resize,
) {
    while let Some(input) = rx.blocking_recv() {
        match input {
            PtyInput::Data(data) => {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    tracing::warn!(bytes = data.len(), error = %e, "Failed to write to tty");
                }
            }
            PtyInput::Resize { rows, cols } => {
                tracing::info!(rows, cols, "Resizing tty");
                if let Err(e) = resizer.resize(rows, cols) {
                    tracing::warn!(error = %e, "Failed to resize tty");
                }
            }
        }
    }
    tracing::debug!("PTY writer exiting");
}

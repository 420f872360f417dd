//! Serialized write side of a session's WebSocket.
//!
//! The outbound bridge, the keepalive monitor and the orchestrator all write
//! to the same connection; frames go through one mutex so they never
//! interleave. The closing notice and the close itself give up after
//! [`CLOSE_TIMEOUT`] so a client that stopped reading cannot hold up
//! teardown.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use thiserror::Error;
use tokio::sync::Mutex;

/// Upper bound on sending the closing notice and on closing the sink.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to send frame: {0}")]
    Send(String),

    #[error("connection already closed")]
    Closed,
}

pub struct ConnectionWriter<S> {
    sink: Mutex<S>,
    closed: AtomicBool,
    farewell_sent: AtomicBool,
}

impl<S> ConnectionWriter<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    pub fn new(sink: S) -> Self {
        Self {
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
            farewell_sent: AtomicBool::new(false),
        }
    }

    pub async fn send(&self, msg: Message) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(msg)
            .await
            .map_err(|e| ConnectionError::Send(e.to_string()))
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ConnectionError> {
        self.send(Message::Text(text.into())).await
    }

    /// Tell the client the session is ending. Only the first call sends anything.
    pub async fn farewell(&self, reason: Option<&str>) {
        if self.farewell_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        let text = format!(
            "server is closing connection, '{}' bye!",
            reason.unwrap_or_default()
        );
        match tokio::time::timeout(CLOSE_TIMEOUT, self.send_text(text)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Failed to send closing notice"),
            Err(_) => tracing::warn!("Timed out sending closing notice"),
        }
    }

    /// Close the connection. Returns false if it was already closed.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let closing = async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, closing).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to close websocket connection"),
            Err(_) => tracing::warn!("Timed out closing websocket connection"),
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::task::{Context, Poll};

    /// Sink that accepts or rejects each frame according to a script.
    /// Once the script runs out every frame is accepted.
    pub(crate) struct ScriptedSink {
        pub script: VecDeque<bool>,
        pub sent: Arc<StdMutex<Vec<Message>>>,
        pub closes: Arc<AtomicUsize>,
    }

    impl ScriptedSink {
        pub fn new(script: impl IntoIterator<Item = bool>) -> Self {
            Self {
                script: script.into_iter().collect(),
                sent: Arc::new(StdMutex::new(Vec::new())),
                closes: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Sink<Message> for ScriptedSink {
        type Error = String;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), String> {
            let this = self.get_mut();
            if this.script.pop_front().unwrap_or(true) {
                this.sent.lock().unwrap().push(item);
                Ok(())
            } else {
                Err("scripted write failure".to_string())
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    /// Peer that stopped reading: every poll stays pending.
    pub(crate) struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = String;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), String> {
            Err("sink never became ready".to_string())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_farewell_sent_once() {
        let sink = ScriptedSink::new([]);
        let sent = Arc::clone(&sink.sent);
        let conn = ConnectionWriter::new(sink);

        conn.farewell(Some("token has expired")).await;
        conn.farewell(Some("ping timeout")).await;

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Message::Text(t) => assert!(t.contains("token has expired")),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_sends() {
        let sink = ScriptedSink::new([]);
        let closes = Arc::clone(&sink.closes);
        let conn = ConnectionWriter::new(sink);

        assert!(conn.close().await);
        assert!(!conn.close().await);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(conn.is_closed());
        assert!(matches!(
            conn.send(Message::Binary(vec![1])).await,
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_send_error_is_reported() {
        let conn = ConnectionWriter::new(ScriptedSink::new([false, true]));
        assert!(matches!(
            conn.send(Message::Binary(vec![1])).await,
            Err(ConnectionError::Send(_))
        ));
        assert!(conn.send(Message::Binary(vec![2])).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_farewell_and_close_give_up_on_stalled_peer() {
        let conn = ConnectionWriter::new(StalledSink);
        let started = tokio::time::Instant::now();

        conn.farewell(Some("ping timeout")).await;
        assert!(conn.close().await);

        assert!(started.elapsed() <= CLOSE_TIMEOUT * 2);
        assert!(conn.is_closed());
    }
}

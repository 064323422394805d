//! Outbound connection actor: one per WebSocket, owns the sink half.
//!
//! The registry never touches a socket. It delivers `ServerEvent`s into a
//! bounded per-connection mailbox through a [`ConnectionActorHandle`]; the
//! actor drains the mailbox and writes JSON text frames. A slow or dead
//! consumer therefore costs at most its own mailbox: `deliver` never blocks,
//! and frames that do not fit are dropped and counted.
//!
//! # Lifecycle
//!
//! 1. Spawned by the gateway on upgrade, before the inbound loop starts
//! 2. Runs until cancelled (disconnect, shutdown) or the sink errors
//! 3. Exiting drops the mailbox receiver, which the registry's link sweep
//!    observes as a disconnect

use crate::events::ServerEvent;
use crate::observability::metrics;

use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use axum::extract::ws::Message;
use common::types::ConnectionId;
use futures::{Sink, SinkExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    connection_id: ConnectionId,
    sender: mpsc::Sender<ServerEvent>,
    cancel_token: CancellationToken,
}

impl ConnectionActorHandle {
    /// Build a handle around an existing mailbox sender.
    ///
    /// Used by `ConnectionActor::spawn` and by tests that want to observe
    /// delivered events on a plain channel.
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        sender: mpsc::Sender<ServerEvent>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            connection_id,
            sender,
            cancel_token,
        }
    }

    /// Get the connection ID.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Enqueue an event for delivery, without blocking.
    ///
    /// A full or closed mailbox drops the frame; the peer is either too slow
    /// to keep a live roster or already gone, and the registry must not stall
    /// on it either way.
    pub fn deliver(&self, event: ServerEvent) {
        let frame = event.kind();
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    target: "cc.actor.connection",
                    connection_id = %self.connection_id,
                    frame = frame,
                    "Mailbox full, dropping frame"
                );
                metrics::record_frame_dropped(frame);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    target: "cc.actor.connection",
                    connection_id = %self.connection_id,
                    frame = frame,
                    "Mailbox closed, dropping frame"
                );
                metrics::record_frame_dropped(frame);
            }
        }
    }

    /// Whether the outbound actor has exited (mailbox receiver dropped).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Cancel the connection actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
///
/// Generic over the sink so tests can substitute a channel for the
/// WebSocket sink half.
pub struct ConnectionActor<S> {
    /// Connection ID.
    connection_id: ConnectionId,
    /// Event receiver (the mailbox).
    receiver: mpsc::Receiver<ServerEvent>,
    /// Socket sink half.
    sink: S,
    /// Cancellation token (child of the registry's token).
    cancel_token: CancellationToken,
    /// Shared metrics.
    actor_metrics: Arc<ActorMetrics>,
    /// Mailbox monitor.
    mailbox: MailboxMonitor,
}

impl<S> ConnectionActor<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: std::fmt::Display,
{
    /// Spawn a new connection actor around a socket sink.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        connection_id: ConnectionId,
        sink: S,
        cancel_token: CancellationToken,
        actor_metrics: Arc<ActorMetrics>,
        mailbox_capacity: usize,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(mailbox_capacity.max(1));

        let actor = Self {
            connection_id,
            receiver,
            sink,
            cancel_token: cancel_token.clone(),
            actor_metrics,
            mailbox: MailboxMonitor::new(ActorType::Connection, connection_id.to_string()),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle::new(connection_id, sender, cancel_token);

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "cc.actor.connection", fields(connection_id = %self.connection_id))]
    async fn run(mut self) {
        debug!(
            target: "cc.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                // Handle cancellation
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "cc.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    self.graceful_close().await;
                    break;
                }

                // Handle events
                event = self.receiver.recv() => {
                    match event {
                        Some(event) => {
                            self.mailbox.record_enqueue();
                            let should_exit = self.write_frame(event).await;
                            self.mailbox.record_dequeue();
                            self.actor_metrics.record_message_processed();

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "cc.actor.connection",
                                connection_id = %self.connection_id,
                                "ConnectionActor mailbox closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "cc.actor.connection",
            connection_id = %self.connection_id,
            frames_written = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }

    /// Serialize and write one frame. Returns true if the actor should exit.
    async fn write_frame(&mut self, event: ServerEvent) -> bool {
        let frame = event.kind();
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                // Serialization of our own types failing is a bug; skip the
                // frame rather than kill the connection.
                error!(
                    target: "cc.actor.connection",
                    connection_id = %self.connection_id,
                    frame = frame,
                    error = %e,
                    "Failed to serialize outbound frame"
                );
                return false;
            }
        };

        if let Err(e) = self.sink.send(Message::Text(json)).await {
            debug!(
                target: "cc.actor.connection",
                connection_id = %self.connection_id,
                frame = frame,
                error = %e,
                "Socket write failed, closing outbound actor"
            );
            return true;
        }

        metrics::record_frame_delivered(frame);
        false
    }

    /// Best-effort close frame before exiting.
    async fn graceful_close(&mut self) {
        if let Err(e) = self.sink.send(Message::Close(None)).await {
            debug!(
                target: "cc.actor.connection",
                connection_id = %self.connection_id,
                error = %e,
                "Close frame not delivered"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    fn text_payload(message: &Message) -> &str {
        match message {
            Message::Text(text) => text,
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_actor_writes_json_frames() {
        let (sink, mut stream) = futures::channel::mpsc::unbounded::<Message>();
        let metrics = ActorMetrics::new();
        let cancel_token = CancellationToken::new();
        let connection_id = ConnectionId::new();

        let (handle, _task) =
            ConnectionActor::spawn(connection_id, sink, cancel_token, metrics, 16);

        handle.deliver(ServerEvent::CallAccepted);
        handle.deliver(ServerEvent::CallError {
            reason: "callee unavailable".to_string(),
        });

        let first = stream.next().await.unwrap();
        assert_eq!(text_payload(&first), r#"{"type":"callAccepted"}"#);

        let second = stream.next().await.unwrap();
        assert!(text_payload(&second).contains("callee unavailable"));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_connection_actor_cancellation_sends_close() {
        let (sink, mut stream) = futures::channel::mpsc::unbounded::<Message>();
        let metrics = ActorMetrics::new();
        let cancel_token = CancellationToken::new();

        let (handle, task) =
            ConnectionActor::spawn(ConnectionId::new(), sink, cancel_token, metrics, 16);

        handle.cancel();

        // Actor exits after writing the close frame
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        let last = stream.next().await.unwrap();
        assert!(matches!(last, Message::Close(None)));
        // Sink dropped with the actor
        assert!(stream.next().await.is_none());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_connection_actor_parent_cancellation() {
        let (sink, _stream) = futures::channel::mpsc::unbounded::<Message>();
        let parent = CancellationToken::new();
        let metrics = ActorMetrics::new();

        let (handle, task) = ConnectionActor::spawn(
            ConnectionId::new(),
            sink,
            parent.child_token(),
            metrics,
            16,
        );

        parent.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_connection_actor_exits_when_sink_drops() {
        let (sink, stream) = futures::channel::mpsc::unbounded::<Message>();
        let metrics = ActorMetrics::new();
        let cancel_token = CancellationToken::new();

        let (handle, task) =
            ConnectionActor::spawn(ConnectionId::new(), sink, cancel_token, metrics, 16);

        // Receiver gone: the next write fails and the actor exits
        drop(stream);
        handle.deliver(ServerEvent::CallEnded);

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_deliver_drops_when_mailbox_full() {
        // Handle around a bare channel, no actor draining it
        let (sender, mut receiver) = mpsc::channel(1);
        let handle =
            ConnectionActorHandle::new(ConnectionId::new(), sender, CancellationToken::new());

        handle.deliver(ServerEvent::CallAccepted);
        // Mailbox is full; this frame is dropped, not queued and not blocking
        handle.deliver(ServerEvent::CallEnded);

        assert_eq!(receiver.recv().await, Some(ServerEvent::CallAccepted));
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deliver_after_close_is_silent() {
        let (sender, receiver) = mpsc::channel(1);
        let handle =
            ConnectionActorHandle::new(ConnectionId::new(), sender, CancellationToken::new());

        drop(receiver);
        assert!(handle.is_closed());
        // Must not panic or block
        handle.deliver(ServerEvent::ReenterQueue);
    }
}

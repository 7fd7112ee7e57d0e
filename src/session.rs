//! Subscriber session lifecycle.
//!
//! A session moves `Connecting -> Active -> Closed`. It joins the registry
//! on activation and leaves it exactly once on close, whichever of the
//! liveness loop, a write failure or shutdown gets there first.

use std::fmt;
use std::sync::Arc;

use axum::extract::ws::Message;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::handle::{ConnectionHandle, DeliveryError};
use crate::registry::SubscriberRegistry;
use crate::shutdown::wait_for_shutdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The subscriber closed the connection or it went away.
    Disconnected,
    ReadError(String),
    WriteFailed(DeliveryError),
    /// The handle was closed from outside the session.
    HandleClosed,
    Shutdown,
}

pub struct SubscriberSession {
    handle: Arc<ConnectionHandle>,
    registry: Arc<SubscriberRegistry>,
    state: Mutex<SessionState>,
}

impl SubscriberSession {
    pub fn new(handle: Arc<ConnectionHandle>, registry: Arc<SubscriberRegistry>) -> Self {
        Self {
            handle,
            registry,
            state: Mutex::new(SessionState::Connecting),
        }
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Join the registry. Returns false unless the session was connecting.
    pub fn activate(&self) -> bool {
        let mut state = self.state.lock();
        if *state != SessionState::Connecting {
            return false;
        }
        self.registry.add(self.handle.clone());
        *state = SessionState::Active;
        tracing::info!(
            connection = %self.handle.id(),
            subscribers = self.registry.len(),
            "subscriber connected"
        );
        true
    }

    /// Tear the session down.
    ///
    /// Only the first call has any effect: the handle leaves the registry,
    /// then the handle is closed so its writer releases the transport.
    /// Returns whether this call performed the teardown.
    pub fn close(&self, reason: &CloseReason) -> bool {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return false;
            }
            *state = SessionState::Closed;
        }

        self.registry.remove(self.handle.id());
        self.handle.close();

        match reason {
            CloseReason::Disconnected | CloseReason::Shutdown | CloseReason::HandleClosed => {
                tracing::info!(
                    connection = %self.handle.id(),
                    ?reason,
                    delivered = self.handle.delivered(),
                    dropped = self.handle.dropped(),
                    "subscriber disconnected"
                )
            }
            CloseReason::ReadError(_) | CloseReason::WriteFailed(_) => {
                tracing::warn!(
                    connection = %self.handle.id(),
                    ?reason,
                    delivered = self.handle.delivered(),
                    "subscriber dropped"
                )
            }
        }
        true
    }

    /// Run the liveness loop until the subscriber goes away, then close.
    ///
    /// Anything the subscriber sends is discarded; reading only serves to
    /// notice the disconnect.
    pub async fn run<S, E>(&self, mut incoming: S, mut shutdown_rx: watch::Receiver<bool>) -> CloseReason
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        self.activate();

        let reason = loop {
            tokio::select! {
                biased;
                _ = self.handle.closed() => {
                    break match self.handle.failure() {
                        Some(err) => CloseReason::WriteFailed(err),
                        None => CloseReason::HandleClosed,
                    };
                }
                _ = wait_for_shutdown(&mut shutdown_rx) => break CloseReason::Shutdown,
                msg = incoming.next() => match msg {
                    Some(Ok(Message::Close(_))) | None => break CloseReason::Disconnected,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break CloseReason::ReadError(e.to_string()),
                },
            }
        };

        self.close(&reason);
        reason
    }
}

impl fmt::Debug for SubscriberSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberSession")
            .field("connection", &self.handle.id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{Broadcaster, RelayStats};
    use crate::handle::DeliveryConfig;
    use crate::payload::Payload;
    use crate::shutdown::{SessionRole, ShutdownCoordinator};
    use futures::channel::mpsc;
    use std::time::Duration;

    type Incoming = mpsc::UnboundedReceiver<Result<Message, String>>;

    fn session_with_sink(
        registry: &Arc<SubscriberRegistry>,
    ) -> (Arc<SubscriberSession>, mpsc::UnboundedReceiver<Payload>) {
        let (tx, rx) = mpsc::unbounded();
        let (handle, _writer) = ConnectionHandle::spawn(tx, DeliveryConfig::default());
        (Arc::new(SubscriberSession::new(handle, registry.clone())), rx)
    }

    #[tokio::test]
    async fn activation_registers_and_close_unregisters() {
        let registry = Arc::new(SubscriberRegistry::new());
        let (session, _rx) = session_with_sink(&registry);

        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!registry.contains(session.handle().id()));

        assert!(session.activate());
        assert!(!session.activate());
        assert_eq!(session.state(), SessionState::Active);
        assert!(registry.contains(session.handle().id()));

        assert!(session.close(&CloseReason::Disconnected));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!registry.contains(session.handle().id()));
        assert!(session.handle().is_closed());
    }

    #[tokio::test]
    async fn double_close_tears_down_once() {
        let registry = Arc::new(SubscriberRegistry::new());
        let (session, _rx) = session_with_sink(&registry);
        let (other, _other_rx) = session_with_sink(&registry);
        session.activate();
        other.activate();

        let write_failure = CloseReason::WriteFailed(DeliveryError::Timeout(Duration::from_secs(5)));
        assert!(session.close(&CloseReason::Disconnected));
        assert!(!session.close(&write_failure));

        assert_eq!(registry.len(), 1);
        assert!(registry.contains(other.handle().id()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_closes_remove_once() {
        let registry = Arc::new(SubscriberRegistry::new());
        let (session, _rx) = session_with_sink(&registry);
        session.activate();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let session = session.clone();
            tasks.push(tokio::spawn(async move { session.close(&CloseReason::Disconnected) }));
        }
        let mut performed = 0;
        for task in tasks {
            if task.await.unwrap() {
                performed += 1;
            }
        }
        assert_eq!(performed, 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn close_before_activation_never_registers() {
        let registry = Arc::new(SubscriberRegistry::new());
        let (session, _rx) = session_with_sink(&registry);

        session.close(&CloseReason::Disconnected);
        assert!(!session.activate());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn liveness_loop_ends_on_subscriber_close() {
        let registry = Arc::new(SubscriberRegistry::new());
        let shutdown = ShutdownCoordinator::new();
        let (session, _rx) = session_with_sink(&registry);
        let (incoming_tx, incoming): (_, Incoming) = mpsc::unbounded();
        let (_guard, shutdown_rx) = shutdown.register(SessionRole::Subscriber);

        let runner = session.clone();
        let task = tokio::spawn(async move { runner.run(incoming, shutdown_rx).await });

        // Chatter from the subscriber is ignored.
        incoming_tx.unbounded_send(Ok(Message::Text("hello".to_string().into()))).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(registry.len(), 1);

        incoming_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        let reason = tokio::time::timeout(Duration::from_millis(200), task)
            .await
            .expect("session should end")
            .unwrap();

        assert_eq!(reason, CloseReason::Disconnected);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn write_failure_closes_the_session() {
        let registry = Arc::new(SubscriberRegistry::new());
        let stats = Arc::new(RelayStats::default());
        let broadcaster = Broadcaster::new(registry.clone(), stats);
        let shutdown = ShutdownCoordinator::new();

        let (session, sink_rx) = session_with_sink(&registry);
        let (_incoming_tx, incoming): (_, Incoming) = mpsc::unbounded();
        let (_guard, shutdown_rx) = shutdown.register(SessionRole::Subscriber);

        let runner = session.clone();
        let task = tokio::spawn(async move { runner.run(incoming, shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.len(), 1);

        drop(sink_rx);
        broadcaster.broadcast(Payload::text("f1"));

        let reason = tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("session should end")
            .unwrap();
        assert!(matches!(reason, CloseReason::WriteFailed(DeliveryError::Transport(_))));
        assert!(registry.is_empty());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn shutdown_closes_the_session() {
        let registry = Arc::new(SubscriberRegistry::new());
        let shutdown = ShutdownCoordinator::new();
        let (session, _rx) = session_with_sink(&registry);
        let (_incoming_tx, incoming): (_, Incoming) = mpsc::unbounded();
        let (guard, shutdown_rx) = shutdown.register(SessionRole::Subscriber);

        let runner = session.clone();
        let task = tokio::spawn(async move {
            let reason = runner.run(incoming, shutdown_rx).await;
            drop(guard);
            reason
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        shutdown.shutdown();
        tokio::time::timeout(Duration::from_millis(200), shutdown.wait_for_all_closed())
            .await
            .expect("session should release its guard");
        assert_eq!(task.await.unwrap(), CloseReason::Shutdown);
        assert!(registry.is_empty());
    }
}

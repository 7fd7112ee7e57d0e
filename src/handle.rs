//! Per-subscriber write path.
//!
//! A [`ConnectionHandle`] owns a bounded outbound queue and a closed signal.
//! A single writer task drains the queue into the subscriber's transport, so
//! writes to one connection never interleave, while every subscriber gets its
//! own writer and a slow one cannot hold up the rest.
//!
//! The queue is a `tokio::sync::broadcast` channel with the writer as its
//! only receiver. Its overflow policy is drop-oldest: when the queue is full
//! the oldest queued frame is overwritten and the writer skips past it. For a
//! live video stream the freshest frame is the one worth sending.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::payload::Payload;

pub const DEFAULT_QUEUE_CAPACITY: usize = 8;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Unique identity of one connection (subscriber or producer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Tuning for the per-subscriber write path.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryConfig {
    /// Frames buffered per subscriber before drop-oldest kicks in. Rounded up
    /// to a power of two.
    pub queue_capacity: usize,
    /// Upper bound on a single transport write.
    pub write_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("transport write failed: {0}")]
    Transport(String),

    #[error("write did not complete within {0:?}")]
    Timeout(Duration),
}

/// Result of offering a payload to a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Queued behind any frames still waiting to be written.
    Queued,
    /// Queued, but the queue was full and the oldest frame was discarded.
    DisplacedOldest,
    /// The handle is closed; nothing was queued.
    Closed,
}

/// The relay's representation of one live subscriber.
pub struct ConnectionHandle {
    id: ConnectionId,
    queue: broadcast::Sender<Payload>,
    capacity: usize,
    closed: CancellationToken,
    failure: Mutex<Option<DeliveryError>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ConnectionHandle {
    /// Create a handle and spawn the writer task that drains it into `sink`.
    ///
    /// The writer owns the sink for its whole life. It stops when the handle
    /// is closed or a write fails, then closes the sink to release the
    /// transport.
    pub fn spawn<S>(sink: S, config: DeliveryConfig) -> (Arc<Self>, JoinHandle<()>)
    where
        S: Sink<Payload> + Send + Unpin + 'static,
        S::Error: fmt::Display + Send,
    {
        // The channel rounds its capacity up to a power of two; use the same
        // figure to tell when an offer overwrites.
        let capacity = config.queue_capacity.max(1).next_power_of_two();
        let (queue, frames) = broadcast::channel(capacity);
        let handle = Arc::new(Self {
            id: ConnectionId::new(),
            queue,
            capacity,
            closed: CancellationToken::new(),
            failure: Mutex::new(None),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        let task = tokio::spawn(write_loop(handle.clone(), frames, sink, config.write_timeout));
        (handle, task)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a payload for delivery. Never blocks on the transport.
    pub fn offer(&self, payload: Payload) -> Offer {
        if self.closed.is_cancelled() {
            return Offer::Closed;
        }
        let full = self.queue.len() >= self.capacity;
        match self.queue.send(payload) {
            Err(_) => Offer::Closed,
            Ok(_) if full => Offer::DisplacedOldest,
            Ok(_) => Offer::Queued,
        }
    }

    /// Mark the handle closed. The writer stops and releases the transport.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the handle is closed, by either side.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// The write failure that closed this handle, if any.
    pub fn failure(&self) -> Option<DeliveryError> {
        self.failure.lock().clone()
    }

    /// Frames successfully written to the transport.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Frames the writer skipped under the drop-oldest policy.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Frames waiting for the writer.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn fail(&self, err: DeliveryError) {
        tracing::warn!(connection = %self.id, error = %err, "delivery failed, closing subscriber");
        self.failure.lock().get_or_insert(err);
        self.closed.cancel();
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("pending", &self.pending())
            .finish()
    }
}

async fn write_loop<S>(
    handle: Arc<ConnectionHandle>,
    mut frames: broadcast::Receiver<Payload>,
    mut sink: S,
    write_timeout: Duration,
) where
    S: Sink<Payload> + Unpin,
    S::Error: fmt::Display + Send,
{
    loop {
        let payload = tokio::select! {
            biased;
            _ = handle.closed.cancelled() => break,
            received = frames.recv() => match received {
                Ok(payload) => payload,
                Err(RecvError::Lagged(skipped)) => {
                    handle.dropped.fetch_add(skipped, Ordering::Relaxed);
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        let result = tokio::select! {
            biased;
            _ = handle.closed.cancelled() => break,
            result = tokio::time::timeout(write_timeout, sink.send(payload)) => result,
        };

        match result {
            Ok(Ok(())) => {
                handle.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                handle.fail(DeliveryError::Transport(e.to_string()));
                break;
            }
            Err(_) => {
                handle.fail(DeliveryError::Timeout(write_timeout));
                break;
            }
        }
    }

    // A stalled peer must not hold the task past the write deadline.
    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
    tracing::debug!(
        connection = %handle.id,
        delivered = handle.delivered(),
        dropped = handle.dropped(),
        "subscriber writer finished"
    );
}

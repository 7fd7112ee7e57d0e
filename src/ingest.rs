use std::fmt;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Stream, StreamExt};
use tokio::sync::watch;

use crate::broadcast::Broadcaster;
use crate::handle::ConnectionId;
use crate::payload::Payload;
use crate::producer::ProducerLease;
use crate::shutdown::wait_for_shutdown;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Limits applied to every producer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerLimits {
    /// Largest frame accepted from a producer.
    pub max_message_bytes: usize,
    /// How often the relay pings an open producer connection.
    pub ping_interval: Duration,
    /// A producer that sends nothing, not even a pong, for this long is
    /// dropped and its slot released.
    pub idle_timeout: Duration,
}

impl Default for ProducerLimits {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            ping_interval: DEFAULT_PING_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Why an ingest loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestEnd {
    /// The producer sent a close frame.
    ProducerClosed,
    /// The transport ended without a close frame.
    StreamEnded,
    ReadError(String),
    /// Nothing arrived within the idle timeout; the connection is presumed
    /// dead.
    Idle(Duration),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub producer: ConnectionId,
    pub frames: u64,
    pub end: IngestEnd,
}

/// Relay every frame from one producer session until it disconnects.
///
/// Each text or binary message is broadcast before the next one is read.
/// Broadcasting only queues the frame on each subscriber, so the producer is
/// never throttled by subscriber writes. Control frames are skipped but still
/// count as signs of life: any message, pongs included, resets the idle
/// deadline. The lease is held for the life of the loop and released on
/// return.
pub async fn run_ingest<S, E>(
    lease: ProducerLease,
    mut incoming: S,
    broadcaster: &Broadcaster,
    idle_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> IngestSummary
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let producer = lease.id();
    let mut frames = 0u64;
    tracing::info!(producer = %producer, "producer connected");

    let end = loop {
        let next = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown_rx) => break IngestEnd::Shutdown,
            next = tokio::time::timeout(idle_timeout, incoming.next()) => match next {
                Ok(next) => next,
                Err(_) => break IngestEnd::Idle(idle_timeout),
            },
        };

        match next {
            Some(Ok(Message::Close(_))) => break IngestEnd::ProducerClosed,
            Some(Ok(msg)) => {
                if let Some(payload) = Payload::from_message(msg) {
                    broadcaster.broadcast(payload);
                    frames += 1;
                }
            }
            Some(Err(e)) => break IngestEnd::ReadError(e.to_string()),
            None => break IngestEnd::StreamEnded,
        }
    };

    match &end {
        IngestEnd::ReadError(error) => {
            tracing::warn!(producer = %producer, frames, %error, "producer read failed")
        }
        IngestEnd::Idle(after) => {
            tracing::warn!(producer = %producer, frames, ?after, "producer went silent, releasing slot")
        }
        _ => tracing::info!(producer = %producer, frames, reason = ?end, "producer disconnected"),
    }
    drop(lease);

    IngestSummary {
        producer,
        frames,
        end,
    }
}

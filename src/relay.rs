use std::fmt;
use std::sync::Arc;

use futures::Sink;
use tokio::task::JoinHandle;

use crate::broadcast::{Broadcaster, RelayStats, StatsSnapshot};
use crate::handle::{ConnectionHandle, DeliveryConfig};
use crate::payload::Payload;
use crate::producer::{IngestError, ProducerLease, ProducerPolicy, ProducerSlot};
use crate::registry::SubscriberRegistry;
use crate::session::{CloseReason, SubscriberSession};

/// One relay instance: the subscriber registry, the broadcaster feeding it
/// and the producer slot. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Relay {
    registry: Arc<SubscriberRegistry>,
    stats: Arc<RelayStats>,
    broadcaster: Broadcaster,
    producers: ProducerSlot,
    delivery: DeliveryConfig,
}

impl Relay {
    pub fn new(delivery: DeliveryConfig, policy: ProducerPolicy) -> Self {
        let registry = Arc::new(SubscriberRegistry::new());
        let stats = Arc::new(RelayStats::default());
        Self {
            broadcaster: Broadcaster::new(registry.clone(), stats.clone()),
            registry,
            stats,
            producers: ProducerSlot::new(policy),
            delivery,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn producers(&self) -> &ProducerSlot {
        &self.producers
    }

    /// Build a subscriber session around a transport sink.
    ///
    /// The session starts in `Connecting`; it joins the registry when
    /// activated or run. The returned task is the handle's writer.
    pub fn subscriber<S>(&self, sink: S) -> (SubscriberSession, JoinHandle<()>)
    where
        S: Sink<Payload> + Send + Unpin + 'static,
        S::Error: fmt::Display + Send,
    {
        let (handle, writer) = ConnectionHandle::spawn(sink, self.delivery);
        (SubscriberSession::new(handle, self.registry.clone()), writer)
    }

    /// Claim the producer slot for a new ingest session.
    pub fn begin_ingest(&self) -> Result<ProducerLease, IngestError> {
        let lease = self.producers.try_acquire()?;
        self.stats.record_producer_session();
        Ok(lease)
    }

    /// Account for a finished subscriber session.
    pub fn record_close(&self, reason: &CloseReason) {
        if let CloseReason::WriteFailed(_) = reason {
            self.stats.record_write_failure();
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats
            .snapshot(self.registry.len(), self.producers.is_active())
    }
}

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::handle::ConnectionId;

/// What to do when a producer connects while another is streaming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProducerPolicy {
    /// Reject the newcomer until the active producer disconnects.
    #[default]
    Exclusive,
    /// Let every producer feed the same subscribers. Frames from different
    /// producers interleave in no particular order.
    Shared,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("producer {0} is already streaming")]
    ProducerBusy(ConnectionId),
}

struct SlotInner {
    policy: ProducerPolicy,
    active: Mutex<Vec<ConnectionId>>,
}

/// Tracks which producer sessions are currently streaming.
#[derive(Clone)]
pub struct ProducerSlot {
    inner: Arc<SlotInner>,
}

impl ProducerSlot {
    pub fn new(policy: ProducerPolicy) -> Self {
        Self {
            inner: Arc::new(SlotInner {
                policy,
                active: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Claim the slot for a new producer session.
    ///
    /// The returned lease releases the slot when dropped.
    pub fn try_acquire(&self) -> Result<ProducerLease, IngestError> {
        let mut active = self.inner.active.lock();
        if self.inner.policy == ProducerPolicy::Exclusive {
            if let Some(current) = active.first() {
                return Err(IngestError::ProducerBusy(*current));
            }
        }
        let id = ConnectionId::new();
        active.push(id);
        Ok(ProducerLease {
            id,
            inner: self.inner.clone(),
        })
    }

    pub fn is_active(&self) -> bool {
        !self.inner.active.lock().is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }
}

/// Proof that a producer session holds the slot.
pub struct ProducerLease {
    id: ConnectionId,
    inner: Arc<SlotInner>,
}

impl ProducerLease {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ProducerLease {
    fn drop(&mut self) {
        self.inner.active.lock().retain(|id| *id != self.id);
    }
}

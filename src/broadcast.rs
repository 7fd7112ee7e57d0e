//! Fan-out of one payload to every registered subscriber.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::handle::Offer;
use crate::payload::Payload;
use crate::registry::SubscriberRegistry;

/// Relay-wide counters.
#[derive(Default)]
pub struct RelayStats {
    frames_ingested: AtomicU64,
    deliveries_queued: AtomicU64,
    frames_dropped: AtomicU64,
    write_failures: AtomicU64,
    producer_sessions: AtomicU64,
}

impl RelayStats {
    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_producer_session(&self) {
        self.producer_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_ingested(&self) -> u64 {
        self.frames_ingested.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, subscribers: usize, producer_active: bool) -> StatsSnapshot {
        StatsSnapshot {
            subscribers,
            producer_active,
            producer_sessions: self.producer_sessions.load(Ordering::Relaxed),
            frames_ingested: self.frames_ingested.load(Ordering::Relaxed),
            deliveries_queued: self.deliveries_queued.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the relay, served on `/stats`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub subscribers: usize,
    pub producer_active: bool,
    pub producer_sessions: u64,
    pub frames_ingested: u64,
    pub deliveries_queued: u64,
    pub frames_dropped: u64,
    pub write_failures: u64,
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Handles in the registry snapshot.
    pub targeted: usize,
    /// Handles that accepted the payload.
    pub queued: usize,
    /// Of those, how many had to discard an older frame.
    pub displaced: usize,
    /// Handles already closed and skipped.
    pub closed: usize,
}

#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<SubscriberRegistry>,
    stats: Arc<RelayStats>,
}

impl Broadcaster {
    pub fn new(registry: Arc<SubscriberRegistry>, stats: Arc<RelayStats>) -> Self {
        Self { registry, stats }
    }

    /// Offer `payload` to every subscriber registered right now.
    ///
    /// Returns once the payload has been queued on each handle. Transport
    /// writes happen on the subscribers' own writer tasks, so this never waits
    /// on a slow subscriber. A handle that already failed is skipped; its
    /// session is responsible for removing it.
    pub fn broadcast(&self, payload: Payload) -> BroadcastReport {
        let snapshot = self.registry.snapshot();
        let mut report = BroadcastReport {
            targeted: snapshot.len(),
            ..Default::default()
        };

        for handle in &snapshot {
            match handle.offer(payload.clone()) {
                Offer::Queued => report.queued += 1,
                Offer::DisplacedOldest => {
                    report.queued += 1;
                    report.displaced += 1;
                }
                Offer::Closed => report.closed += 1,
            }
        }

        self.stats.frames_ingested.fetch_add(1, Ordering::Relaxed);
        self.stats
            .deliveries_queued
            .fetch_add(report.queued as u64, Ordering::Relaxed);
        self.stats
            .frames_dropped
            .fetch_add(report.displaced as u64, Ordering::Relaxed);

        tracing::trace!(
            bytes = payload.byte_len(),
            targeted = report.targeted,
            displaced = report.displaced,
            "frame broadcast"
        );
        report
    }
}

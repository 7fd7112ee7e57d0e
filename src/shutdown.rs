//! Graceful shutdown of relay sessions.
//!
//! Every producer and subscriber session registers here. On shutdown the
//! coordinator flips a watch flag that each session loop selects on, then
//! the process waits until every session guard has been dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Producer,
    Subscriber,
}

/// Coordinates graceful shutdown of producer and subscriber sessions.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    shutdown_tx: watch::Sender<bool>,
    producers: AtomicUsize,
    subscribers: AtomicUsize,
    /// Notified when the last session closes
    all_closed: Notify,
}

impl Inner {
    fn counter(&self, role: SessionRole) -> &AtomicUsize {
        match role {
            SessionRole::Producer => &self.producers,
            SessionRole::Subscriber => &self.subscribers,
        }
    }

    fn total(&self) -> usize {
        self.producers.load(Ordering::SeqCst) + self.subscribers.load(Ordering::SeqCst)
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                shutdown_tx,
                producers: AtomicUsize::new(0),
                subscribers: AtomicUsize::new(0),
                all_closed: Notify::new(),
            }),
        }
    }

    /// Register a session. The guard must live as long as the session; the
    /// receiver flips to `true` when shutdown starts.
    pub fn register(&self, role: SessionRole) -> (SessionGuard, watch::Receiver<bool>) {
        self.inner.counter(role).fetch_add(1, Ordering::SeqCst);
        let guard = SessionGuard {
            inner: self.inner.clone(),
            role,
        };
        (guard, self.inner.shutdown_tx.subscribe())
    }

    /// Signal every session to close.
    pub fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    /// Wait until every registered session has closed.
    pub async fn wait_for_all_closed(&self) {
        loop {
            let notified = self.inner.all_closed.notified();
            tokio::pin!(notified);
            // Enable before reading the count so a guard dropped in between
            // still wakes us.
            notified.as_mut().enable();

            let count = self.inner.total();
            if count == 0 {
                return;
            }
            tracing::debug!(count, "waiting for sessions to close");
            notified.await;
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.total()
    }

    pub fn active(&self, role: SessionRole) -> usize {
        self.inner.counter(role).load(Ordering::SeqCst)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once `rx` observes `true`. Never resolves if the coordinator is
/// dropped without signalling.
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// RAII guard that deregisters a session when dropped.
pub struct SessionGuard {
    inner: Arc<Inner>,
    role: SessionRole,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.inner.counter(self.role).fetch_sub(1, Ordering::SeqCst);
        if self.inner.total() == 0 {
            self.inner.all_closed.notify_waiters();
        }
    }
}

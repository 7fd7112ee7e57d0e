use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::handle::{ConnectionHandle, ConnectionId};

/// The set of subscribers currently in an active session.
///
/// One lock guards the map and is held only for the map operation itself.
/// Delivery works on a [`snapshot`](Self::snapshot), so no transport write
/// ever happens under this lock.
#[derive(Default)]
pub struct SubscriberRegistry {
    handles: Mutex<HashMap<ConnectionId, Arc<ConnectionHandle>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle. Returns false if it was already registered.
    pub fn add(&self, handle: Arc<ConnectionHandle>) -> bool {
        let mut handles = self.handles.lock();
        if handles.contains_key(&handle.id()) {
            return false;
        }
        handles.insert(handle.id(), handle);
        true
    }

    /// Remove a handle if present.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.handles.lock().remove(&id)
    }

    /// Copy out the current members for delivery.
    pub fn snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.handles.lock().values().cloned().collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.handles.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

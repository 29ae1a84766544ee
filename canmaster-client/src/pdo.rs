//! PDO receive dispatch
//!
//! Incoming process data frames are demultiplexed by COB-ID into registered
//! callbacks. Registration is exclusive (write lock); dispatch takes the
//! read lock, so it never contends with other dispatches. Panics in
//! callbacks are caught at the dispatch boundary - the bus is lossy and the
//! receive thread must not die because of one bad frame or callback.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A callback invoked with the payload of a matching PDO frame
pub type PdoCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// A callback invoked on every SYNC frame
pub type SyncCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle for removing a registered callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackHandle(u64);

struct PdoRouterInner {
    callbacks: RwLock<HashMap<u16, Vec<(u64, PdoCallback)>>>,
    sync_listeners: RwLock<Vec<(u64, SyncCallback)>>,
    next_id: AtomicU64,
}

/// Demultiplexes incoming PDO frames to registered callbacks by COB-ID
#[derive(Clone)]
pub struct PdoRouter {
    inner: Arc<PdoRouterInner>,
}

impl PdoRouter {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(PdoRouterInner {
                callbacks: RwLock::new(HashMap::new()),
                sync_listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a callback for every incoming frame with the given COB-ID
    pub fn add_pdo_received_callback(&self, cob_id: u16, callback: PdoCallback) -> CallbackHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .callbacks
            .write()
            .unwrap()
            .entry(cob_id)
            .or_default()
            .push((id, callback));
        CallbackHandle(id)
    }

    /// Remove a previously registered callback
    pub fn remove_pdo_received_callback(&self, cob_id: u16, handle: CallbackHandle) {
        if let Some(list) = self.inner.callbacks.write().unwrap().get_mut(&cob_id) {
            list.retain(|(id, _)| *id != handle.0);
        }
    }

    /// Register a callback fired on every incoming SYNC frame
    pub fn add_sync_callback(&self, callback: SyncCallback) -> CallbackHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .sync_listeners
            .write()
            .unwrap()
            .push((id, callback));
        CallbackHandle(id)
    }

    /// Remove a previously registered SYNC callback
    pub fn remove_sync_callback(&self, handle: CallbackHandle) {
        self.inner
            .sync_listeners
            .write()
            .unwrap()
            .retain(|(id, _)| *id != handle.0);
    }

    /// Dispatch an incoming PDO payload to all callbacks for its COB-ID
    ///
    /// The callback list is snapshotted before invocation, so callbacks may
    /// trigger registrations or removals without deadlocking the router.
    pub(crate) fn dispatch(&self, cob_id: u16, data: &[u8]) {
        let callbacks: Vec<PdoCallback> = {
            let registry = self.inner.callbacks.read().unwrap();
            let Some(list) = registry.get(&cob_id) else {
                log::trace!("No callbacks registered for PDO with COB-ID {cob_id:#X}");
                return;
            };
            list.iter().map(|(_, callback)| callback.clone()).collect()
        };
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(data))).is_err() {
                log::error!("Panic in PDO callback for COB-ID {cob_id:#X} (isolated)");
            }
        }
    }

    /// Dispatch an incoming SYNC frame to all sync listeners
    pub(crate) fn dispatch_sync(&self) {
        let callbacks: Vec<SyncCallback> = {
            let listeners = self.inner.sync_listeners.read().unwrap();
            listeners.iter().map(|(_, callback)| callback.clone()).collect()
        };
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                log::error!("Panic in SYNC callback (isolated)");
            }
        }
    }
}

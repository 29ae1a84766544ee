//! NMT master layer
//!
//! Emits module control commands, consumes heartbeats, and supervises
//! device liveness. Liveness callbacks may perform slow work (including SDO
//! transfers), so they are dispatched through the deferred callback worker,
//! never on the receive thread.
//!
//! Callbacks must not re-enter the registration APIs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use canmaster_common::constants::HEARTBEAT_BASE;
use canmaster_common::messages::{CanId, CanMessage, NmtCommand, NmtCommandSpecifier};
use canmaster_common::traits::CanSendError;

use crate::core::SharedSender;
use crate::executor::TaskSpawner;

/// Liveness of a node as tracked by heartbeat supervision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Heartbeats are arriving
    Alive,
    /// One deadline missed; one more missed check and the node is dead
    ToBeKilled,
    /// No heartbeats within the deadline
    Dead,
}

/// Callback invoked with a node ID on liveness transitions
pub type DeviceLivenessCallback = Arc<dyn Fn(u8) + Send + Sync>;

struct TrackedNode {
    state: DeviceState,
    last_seen: Instant,
}

struct NmtInner {
    sender: SharedSender,
    spawner: TaskSpawner,
    nodes: Mutex<HashMap<u8, TrackedNode>>,
    device_alive_callbacks: Mutex<Vec<DeviceLivenessCallback>>,
    device_dead_callbacks: Mutex<Vec<DeviceLivenessCallback>>,
    alive_check_interval: Mutex<Duration>,
    dead_check_count: u32,
    terminating: Arc<AtomicBool>,
    checker: Mutex<Option<JoinHandle<()>>>,
}

/// The NMT master: command emission and heartbeat supervision
#[derive(Clone)]
pub struct NmtLayer {
    inner: Arc<NmtInner>,
}

impl NmtLayer {
    pub(crate) fn new(
        sender: SharedSender,
        spawner: TaskSpawner,
        alive_check_interval: Duration,
        dead_check_count: u32,
        terminating: Arc<AtomicBool>,
    ) -> Self {
        let layer = Self {
            inner: Arc::new(NmtInner {
                sender,
                spawner,
                nodes: Mutex::new(HashMap::new()),
                device_alive_callbacks: Mutex::new(Vec::new()),
                device_dead_callbacks: Mutex::new(Vec::new()),
                alive_check_interval: Mutex::new(alive_check_interval),
                dead_check_count,
                terminating,
                checker: Mutex::new(None),
            }),
        };
        layer.start_liveness_checker();
        layer
    }

    /// Send an NMT command to a single node
    pub fn send_nmt_message(
        &self,
        node_id: u8,
        cmd: NmtCommandSpecifier,
    ) -> Result<(), CanSendError> {
        log::debug!("Sending NMT command {cmd:?} to node {node_id}");
        self.inner
            .sender
            .send(NmtCommand { cmd, node: node_id }.into())
    }

    /// Broadcast an NMT command to all nodes
    pub fn broadcast_nmt_message(&self, cmd: NmtCommandSpecifier) -> Result<(), CanSendError> {
        self.send_nmt_message(0, cmd)
    }

    /// Reset all nodes in the network
    pub fn reset_all_nodes(&self) -> Result<(), CanSendError> {
        self.broadcast_nmt_message(NmtCommandSpecifier::ResetNode)
    }

    /// Poll for nodes via the node guard protocol
    ///
    /// Sends an RTR frame to every possible heartbeat COB-ID; living nodes
    /// answer with their state, which feeds the liveness tracking.
    pub fn discover_nodes(&self) -> Result<(), CanSendError> {
        for node_id in 1..=127u16 {
            self.inner
                .sender
                .send(CanMessage::new_rtr(CanId::std(HEARTBEAT_BASE + node_id)))?;
        }
        Ok(())
    }

    /// Register a callback fired when a node is first seen alive
    ///
    /// Must not be called from within a liveness callback.
    pub fn register_device_alive_callback(&self, callback: DeviceLivenessCallback) {
        self.inner
            .device_alive_callbacks
            .lock()
            .unwrap()
            .push(callback);
    }

    /// Register a callback fired exactly once when a node is declared dead
    ///
    /// Must not be called from within a liveness callback.
    pub fn register_device_dead_callback(&self, callback: DeviceLivenessCallback) {
        self.inner
            .device_dead_callbacks
            .lock()
            .unwrap()
            .push(callback);
    }

    /// Change how often liveness is checked
    pub fn change_alive_check_interval(&self, interval: Duration) {
        *self.inner.alive_check_interval.lock().unwrap() = interval;
    }

    /// Get the currently tracked liveness of a node, if it has ever been seen
    pub fn device_state(&self, node_id: u8) -> Option<DeviceState> {
        self.inner
            .nodes
            .lock()
            .unwrap()
            .get(&node_id)
            .map(|n| n.state)
    }

    /// Process an incoming heartbeat / bootup frame
    ///
    /// Called from the Core's receive thread for every frame in the
    /// 0x700..=0x77F range.
    pub(crate) fn handle_heartbeat(&self, msg: CanMessage) {
        if msg.is_rtr() {
            // Our own node guard request looping back
            return;
        }
        let node_id = (msg.id().raw() & 0x7F) as u8;
        if node_id == 0 {
            return;
        }

        let newly_alive = {
            let mut nodes = self.inner.nodes.lock().unwrap();
            match nodes.get_mut(&node_id) {
                Some(node) => {
                    let was_dead = node.state == DeviceState::Dead;
                    node.state = DeviceState::Alive;
                    node.last_seen = Instant::now();
                    was_dead
                }
                None => {
                    nodes.insert(
                        node_id,
                        TrackedNode {
                            state: DeviceState::Alive,
                            last_seen: Instant::now(),
                        },
                    );
                    true
                }
            }
        };

        if newly_alive {
            log::info!("Node {node_id} is alive");
            self.fire_callbacks(&self.inner.device_alive_callbacks, node_id);
        }
    }

    fn fire_callbacks(&self, callbacks: &Mutex<Vec<DeviceLivenessCallback>>, node_id: u8) {
        let callbacks = callbacks.lock().unwrap().clone();
        for callback in callbacks {
            self.inner.spawner.spawn(move || callback(node_id));
        }
    }

    fn start_liveness_checker(&self) {
        let layer = self.clone();
        let handle = std::thread::Builder::new()
            .name("canmaster-liveness".into())
            .spawn(move || {
                while !layer.inner.terminating.load(Ordering::SeqCst) {
                    let interval = *layer.inner.alive_check_interval.lock().unwrap();
                    std::thread::sleep(interval);
                    layer.check_alive_devices(interval);
                }
            })
            .expect("failed to spawn liveness checker");
        *self.inner.checker.lock().unwrap() = Some(handle);
    }

    fn check_alive_devices(&self, interval: Duration) {
        let deadline = interval * self.inner.dead_check_count;
        let mut died = Vec::new();
        {
            let mut nodes = self.inner.nodes.lock().unwrap();
            for (node_id, node) in nodes.iter_mut() {
                if node.last_seen.elapsed() < deadline {
                    continue;
                }
                match node.state {
                    DeviceState::Alive => node.state = DeviceState::ToBeKilled,
                    DeviceState::ToBeKilled => {
                        node.state = DeviceState::Dead;
                        died.push(*node_id);
                    }
                    DeviceState::Dead => (),
                }
            }
        }
        for node_id in died {
            log::warn!("Node {node_id} is dead (no heartbeat)");
            self.fire_callbacks(&self.inner.device_dead_callbacks, node_id);
        }
    }

    /// Join the liveness checker; requires the terminating flag to be set
    pub(crate) fn shutdown(&self) {
        if let Some(handle) = self.inner.checker.lock().unwrap().take() {
            if handle.join().is_err() {
                log::error!("Liveness checker panicked");
            }
        }
    }
}

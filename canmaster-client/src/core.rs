//! The core bus facade
//!
//! Owns the CAN driver: a receive thread takes frames off the bus and
//! dispatches them by COB-ID range to the SDO, PDO and NMT subsystems, and
//! all outbound traffic funnels through a mutex-serialized shared sender.
//! Dispatch on the receive thread is fast; user callbacks run elsewhere.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use canmaster_common::constants::{self, NMT_CMD_ID, SYNC_ID};
use canmaster_common::messages::CanMessage;
use canmaster_common::traits::{CanReceiver, CanRecvError, CanSendError, CanSender};

use crate::config::MasterConfig;
use crate::executor::{CallbackExecutor, TaskSpawner};
use crate::nmt::NmtLayer;
use crate::pdo::PdoRouter;
use crate::sdo::SdoEngine;

/// A cloneable, mutex-serialized handle to the outbound CAN driver
#[derive(Clone)]
pub struct SharedSender {
    inner: Arc<Mutex<Box<dyn CanSender>>>,
}

impl SharedSender {
    fn new(sender: Box<dyn CanSender>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sender)),
        }
    }

    /// Send a single frame, best effort
    pub fn send(&self, msg: CanMessage) -> Result<(), CanSendError> {
        self.inner.lock().unwrap().send(msg)
    }
}

/// The heart of the master: driver ownership, frame dispatch, subsystems
///
/// A `Core` must outlive every [`Device`](crate::Device) bound to it.
pub struct Core {
    sender: SharedSender,
    sdo: SdoEngine,
    pdo: PdoRouter,
    nmt: NmtLayer,
    config: MasterConfig,
    terminating: Arc<AtomicBool>,
    executor: Mutex<CallbackExecutor>,
    receive_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Core {
    /// Create a core on an opened driver and start the receive thread
    pub fn new(
        sender: impl CanSender + 'static,
        receiver: impl CanReceiver + 'static,
        config: MasterConfig,
    ) -> Self {
        let terminating = Arc::new(AtomicBool::new(false));
        let sender = SharedSender::new(Box::new(sender));
        let executor = CallbackExecutor::new(terminating.clone());

        let sdo = SdoEngine::new(sender.clone(), config.sdo_response_timeout);
        let pdo = PdoRouter::new();
        let nmt = NmtLayer::new(
            sender.clone(),
            executor.spawner(),
            config.alive_check_interval,
            config.dead_check_count,
            terminating.clone(),
        );

        let core = Self {
            sender,
            sdo,
            pdo,
            nmt,
            config,
            terminating,
            executor: Mutex::new(executor),
            receive_thread: Mutex::new(None),
        };
        core.start_receive_thread(receiver);
        core
    }

    fn start_receive_thread(&self, mut receiver: impl CanReceiver + 'static) {
        let sdo = self.sdo.clone();
        let pdo = self.pdo.clone();
        let nmt = self.nmt.clone();
        let terminating = self.terminating.clone();

        let handle = std::thread::Builder::new()
            .name("canmaster-receive".into())
            .spawn(move || {
                while !terminating.load(Ordering::SeqCst) {
                    match receiver.recv(Duration::from_millis(100)) {
                        Ok(msg) => dispatch(&sdo, &pdo, &nmt, msg),
                        Err(CanRecvError::Timeout) => (),
                        Err(CanRecvError::Disconnected) => {
                            log::error!("CAN driver disconnected, receive thread exiting");
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn receive thread");
        *self.receive_thread.lock().unwrap() = Some(handle);
    }

    /// The SDO engine
    pub fn sdo(&self) -> &SdoEngine {
        &self.sdo
    }

    /// The PDO dispatch router
    pub fn pdo(&self) -> &PdoRouter {
        &self.pdo
    }

    /// The NMT layer
    pub fn nmt(&self) -> &NmtLayer {
        &self.nmt
    }

    /// The configuration this core was built with
    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// A cloneable handle to the serialized outbound path
    pub fn sender(&self) -> SharedSender {
        self.sender.clone()
    }

    pub(crate) fn spawner(&self) -> TaskSpawner {
        self.executor.lock().unwrap().spawner()
    }

    /// Send a raw frame
    pub fn send(&self, msg: CanMessage) -> Result<(), CanSendError> {
        self.sender.send(msg)
    }

    /// Stop all background threads; bounded by their sleep intervals
    ///
    /// Called automatically on drop. Devices bound to this core must be
    /// dropped first.
    pub fn shutdown(&self) {
        if self.terminating.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.receive_thread.lock().unwrap().take() {
            if handle.join().is_err() {
                log::error!("Receive thread panicked");
            }
        }
        self.nmt.shutdown();
        self.executor.lock().unwrap().shutdown();
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch(sdo: &SdoEngine, pdo: &PdoRouter, nmt: &NmtLayer, msg: CanMessage) {
    if msg.id().is_extended() {
        // The pre-defined connection set is 11-bit only
        return;
    }
    let cob_id = msg.id().raw() as u16;

    if constants::is_sdo_response_id(cob_id) {
        sdo.handle_response(msg);
    } else if constants::is_heartbeat_id(cob_id) {
        nmt.handle_heartbeat(msg);
    } else if cob_id == SYNC_ID {
        pdo.dispatch_sync();
    } else if (EMCY_RANGE_START..=EMCY_RANGE_END).contains(&cob_id) {
        log::warn!(
            "Emergency message from node {}: {:02X?}",
            cob_id & 0x7F,
            msg.data()
        );
    } else if constants::is_pdo_id(cob_id) {
        pdo.dispatch(cob_id, msg.data());
    } else if constants::is_sdo_request_id(cob_id) || cob_id == NMT_CMD_ID {
        // Master-originated traffic looping back; nothing to do
    } else {
        log::trace!("Unhandled frame with COB-ID {cob_id:#X}");
    }
}

const EMCY_RANGE_START: u16 = constants::EMCY_BASE + 1;
const EMCY_RANGE_END: u16 = constants::EMCY_BASE + 0x7F;

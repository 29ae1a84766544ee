//! Receive and transmit PDO mappings
//!
//! Mappings bind windows of a PDO's 8-byte payload to dictionary entries.
//! They hold the entry *name*, not a pointer, and resolve through the
//! dictionary on every event; the dispatch side holds a weak handle to the
//! device, so a device being torn down simply stops receiving frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::core::SharedSender;
use crate::device::DeviceInner;
use crate::entry::Address;
use crate::pdo::{CallbackHandle, PdoRouter};

/// When a transmit PDO is put on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionType {
    /// Sent whenever one of the mapped entries changes value
    OnChange,
    /// Sent by a dedicated timer thread at a fixed repeat time
    Periodic,
    /// Sent on every incoming SYNC frame
    Sync,
}

/// One window of a transmit PDO: an entry plus its byte offset in the frame
#[derive(Debug, Clone)]
pub struct Mapping {
    /// Normalized name of the mapped entry
    pub entry_name: String,
    /// Byte offset of the entry's value within the frame
    pub offset: u8,
}

/// Binds a window of an incoming PDO to a dictionary entry
#[derive(Debug, Clone)]
pub struct ReceivePdoMapping {
    /// COB-ID of the PDO carrying the data
    pub cob_id: u16,
    /// Normalized name of the target entry
    pub entry_name: String,
    /// Byte offset of the entry's value within the payload
    pub offset: u8,
}

/// A transmit PDO: a set of mapped entries marshalled into one frame
///
/// Depending on the transmission type it owns a periodic timer thread,
/// value-changed observer registrations, or a SYNC listener registration.
/// All of these are released on drop.
pub struct TransmitPdoMapping {
    /// COB-ID the frame is sent with
    pub cob_id: u16,
    /// When the frame is emitted
    pub transmission_type: TransmissionType,
    /// Send period for [`TransmissionType::Periodic`]
    pub repeat_time: Duration,
    /// The mapped entries
    pub mappings: Vec<Mapping>,
    pub(crate) device: Weak<DeviceInner>,
    pub(crate) sender: SharedSender,
    pub(crate) pdo_router: PdoRouter,
    pub(crate) run_periodic_transmitter: AtomicBool,
    pub(crate) periodic_transmitter: Mutex<Option<JoinHandle<()>>>,
    pub(crate) observer_ids: Mutex<Vec<(Address, u64)>>,
    pub(crate) sync_handle: Mutex<Option<CallbackHandle>>,
}

impl TransmitPdoMapping {
    /// Assemble the frame from the current entry values and send it
    ///
    /// Uninitialized entries contribute zero bytes. Dropped silently when
    /// the owning device is shutting down.
    pub fn send(&self) {
        let Some(device) = self.device.upgrade() else {
            return;
        };
        match device.assemble_pdo_frame(self.cob_id, &self.mappings) {
            Ok(msg) => {
                if self.sender.send(msg).is_err() {
                    log::warn!("Failed to send PDO with COB-ID {:#X}", self.cob_id);
                }
            }
            Err(e) => {
                log::error!(
                    "Cannot assemble PDO with COB-ID {:#X}: {e}",
                    self.cob_id
                );
            }
        }
    }

    /// Stop the timer thread and release observer registrations; idempotent
    pub(crate) fn stop(&self) {
        self.run_periodic_transmitter.store(false, Ordering::SeqCst);
        let handle = self.periodic_transmitter.lock().unwrap().take();
        if let Some(handle) = handle {
            // The final drop can happen on the timer thread itself, which
            // must not join itself; the thread exits on the cleared flag.
            if handle.thread().id() != std::thread::current().id()
                && handle.join().is_err()
            {
                log::error!(
                    "Periodic transmitter for COB-ID {:#X} panicked",
                    self.cob_id
                );
            }
        }
        if let Some(handle) = self.sync_handle.lock().unwrap().take() {
            self.pdo_router.remove_sync_callback(handle);
        }
        let observers: Vec<_> = self.observer_ids.lock().unwrap().drain(..).collect();
        if let Some(device) = self.device.upgrade() {
            for (address, id) in observers {
                if let Some(entry) = device.entry_by_address(address) {
                    entry.remove_value_changed_callback(id);
                }
            }
        }
    }
}

impl Drop for TransmitPdoMapping {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TransmitPdoMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmitPdoMapping")
            .field("cob_id", &self.cob_id)
            .field("transmission_type", &self.transmission_type)
            .field("repeat_time", &self.repeat_time)
            .field("mappings", &self.mappings)
            .finish()
    }
}

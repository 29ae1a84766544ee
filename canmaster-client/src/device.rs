//! The per-slave device abstraction
//!
//! A [`Device`] mediates between a process-local view of a remote node and
//! the bus: a typed object dictionary indexed by address and by symbolic
//! name, SDO-backed reads and writes with bounded retries, PDO mappings in
//! both directions, a heartbeat producer, and remote PDO reconfiguration
//! over SDO.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use canmaster_common::messages::{CanId, CanMessage, NmtCommandSpecifier, NmtState};
use canmaster_common::{constants, DataType, NodeId, Value};

use crate::core::{Core, SharedSender};
use crate::entry::{
    AccessType, Address, Entry, ReadAccessMethod, WriteAccessMethod,
};
use crate::error::{
    CanOpenError, CanopenSnafu, DictionaryError, MappingOverlapSnafu, MappingSizeSnafu,
    ProtocolSnafu, ResponseTimeoutSnafu, SdoError, UnknownConstantSnafu, UnknownEntrySnafu,
    UnknownOperationSnafu,
};
use crate::executor::TaskSpawner;
use crate::nmt::NmtLayer;
use crate::pdo::{CallbackHandle, PdoRouter};
use crate::pdo_mapping::{Mapping, ReceivePdoMapping, TransmissionType, TransmitPdoMapping};
use crate::profiles;
use crate::sdo::SdoEngine;
use crate::utils;

/// A callable per-profile operation: takes the device and an argument value
pub type Operation = Arc<dyn Fn(&Device, &Value) -> Result<Value, CanOpenError> + Send + Sync>;

/// Selects one of the four standard transmit PDOs of a slave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpdoNo {
    /// TPDO1 (0x1800 / 0x1A00)
    Tpdo1,
    /// TPDO2 (0x1801 / 0x1A01)
    Tpdo2,
    /// TPDO3 (0x1802 / 0x1A02)
    Tpdo3,
    /// TPDO4 (0x1803 / 0x1A03)
    Tpdo4,
}

impl TpdoNo {
    /// Communication and mapping parameter record indexes of this TPDO
    pub fn indexes(&self) -> (u16, u16) {
        let k = *self as u16;
        (0x1800 + k, 0x1A00 + k)
    }

    /// Map a zero-based PDO number to a TPDO selector
    pub fn from_number(n: usize) -> Option<Self> {
        match n {
            0 => Some(Self::Tpdo1),
            1 => Some(Self::Tpdo2),
            2 => Some(Self::Tpdo3),
            3 => Some(Self::Tpdo4),
            _ => None,
        }
    }
}

/// Selects one of the four standard receive PDOs of a slave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpdoNo {
    /// RPDO1 (0x1400 / 0x1600)
    Rpdo1,
    /// RPDO2 (0x1401 / 0x1601)
    Rpdo2,
    /// RPDO3 (0x1402 / 0x1602)
    Rpdo3,
    /// RPDO4 (0x1403 / 0x1603)
    Rpdo4,
}

impl RpdoNo {
    /// Communication and mapping parameter record indexes of this RPDO
    pub fn indexes(&self) -> (u16, u16) {
        let k = *self as u16;
        (0x1400 + k, 0x1600 + k)
    }

    /// Map a zero-based PDO number to an RPDO selector
    pub fn from_number(n: usize) -> Option<Self> {
        match n {
            0 => Some(Self::Rpdo1),
            1 => Some(Self::Rpdo2),
            2 => Some(Self::Rpdo3),
            3 => Some(Self::Rpdo4),
            _ => None,
        }
    }
}

pub(crate) struct DeviceInner {
    node_id: NodeId,
    sdo: SdoEngine,
    pdo: PdoRouter,
    nmt: NmtLayer,
    sender: SharedSender,
    spawner: TaskSpawner,
    sdo_response_timeout: Duration,
    repeats_on_sdo_timeout: usize,
    dictionary: RwLock<HashMap<Address, Arc<Entry>>>,
    name_to_address: RwLock<HashMap<String, Address>>,
    operations: RwLock<HashMap<String, Operation>>,
    constants: RwLock<HashMap<String, Value>>,
    receive_pdo_mappings: Mutex<Vec<Arc<ReceivePdoMapping>>>,
    transmit_pdo_mappings: Mutex<Vec<Arc<TransmitPdoMapping>>>,
    registered_pdo_callbacks: Mutex<Vec<(u16, CallbackHandle)>>,
    next_callback_id: AtomicU64,
    heartbeat_thread: Mutex<Option<JoinHandle<()>>>,
    terminating: Arc<AtomicBool>,
}

impl DeviceInner {
    pub(crate) fn entry_by_address(&self, address: Address) -> Option<Arc<Entry>> {
        self.dictionary.read().unwrap().get(&address).cloned()
    }

    /// Look up an entry by an already-normalized name
    fn entry_by_escaped_name(&self, name: &str) -> Option<Arc<Entry>> {
        let address = *self.name_to_address.read().unwrap().get(name)?;
        self.entry_by_address(address)
    }

    /// Default dispatch for a receive PDO mapping: update the dictionary
    ///
    /// Wire-shaped problems (short payload, unresolvable entry) are logged
    /// and swallowed - the bus is lossy and a malformed frame must not tear
    /// anything down.
    fn pdo_received(&self, mapping: &ReceivePdoMapping, data: &[u8]) {
        log::debug!(
            "Received PDO for mapping '{}' on COB-ID {:#X}",
            mapping.entry_name,
            mapping.cob_id
        );
        let Some(entry) = self.entry_by_escaped_name(&mapping.entry_name) else {
            log::error!(
                "Entry '{}' for PDO mapping no longer in dictionary",
                mapping.entry_name
            );
            return;
        };
        let Some(size) = entry.data_type.size() else {
            log::error!(
                "Entry '{}' has no valid PDO-mappable type",
                mapping.entry_name
            );
            return;
        };
        let offset = mapping.offset as usize;
        if data.len() < offset + size {
            log::warn!(
                "PDO for '{}' has wrong size ({} < {}), ignoring it",
                mapping.entry_name,
                data.len(),
                offset + size
            );
            return;
        }
        match Value::from_bytes(entry.data_type, &data[offset..offset + size]) {
            Ok(value) => entry.set_value(value),
            Err(e) => log::error!("Cannot decode PDO data for '{}': {e}", mapping.entry_name),
        }
    }

    /// Marshal the mapped entries into one frame
    ///
    /// Frame length is the highest offset+size across the mappings; bytes
    /// not covered by an initialized entry stay zero.
    pub(crate) fn assemble_pdo_frame(
        &self,
        cob_id: u16,
        mappings: &[Mapping],
    ) -> Result<CanMessage, DictionaryError> {
        let mut payload = [0u8; 8];
        let mut len = 0usize;
        for mapping in mappings {
            let entry = self.entry_by_escaped_name(&mapping.entry_name).ok_or(
                UnknownEntrySnafu {
                    entry: mapping.entry_name.clone(),
                }
                .build(),
            )?;
            let offset = mapping.offset as usize;
            let size = entry.data_type.size().unwrap_or(0);
            let value = entry.get_value();
            if !value.is_invalid() {
                payload[offset..offset + size].copy_from_slice(value.bytes());
            }
            len = len.max(offset + size);
        }
        Ok(CanMessage::new(CanId::std(cob_id), &payload[..len]))
    }
}

/// The master-side abstraction of one CANopen slave
///
/// Created bound to a [`Core`] and a node ID; the core must outlive the
/// device. Dropping the device unregisters its PDO callbacks and joins its
/// background threads.
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Create a device bound to a core and a slave node ID
    ///
    /// The dictionary starts empty; populate it from an EDS file (see
    /// [`load_eds_file`](crate::load_eds_file)) or via
    /// [`add_entry`](Self::add_entry).
    pub fn new(core: &Core, node_id: NodeId) -> Self {
        let config = core.config();
        Self {
            inner: Arc::new(DeviceInner {
                node_id,
                sdo: core.sdo().clone(),
                pdo: core.pdo().clone(),
                nmt: core.nmt().clone(),
                sender: core.sender(),
                spawner: core.spawner(),
                sdo_response_timeout: config.sdo_response_timeout,
                repeats_on_sdo_timeout: config.repeats_on_sdo_timeout,
                dictionary: RwLock::new(HashMap::new()),
                name_to_address: RwLock::new(HashMap::new()),
                operations: RwLock::new(HashMap::new()),
                constants: RwLock::new(HashMap::new()),
                receive_pdo_mappings: Mutex::new(Vec::new()),
                transmit_pdo_mappings: Mutex::new(Vec::new()),
                registered_pdo_callbacks: Mutex::new(Vec::new()),
                next_callback_id: AtomicU64::new(1),
                heartbeat_thread: Mutex::new(None),
                terminating: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// The slave's node ID
    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    /// Install profile operations and constants, then start the node
    ///
    /// Reads the device profile number (low word of entry 0x1000) to select
    /// the profile, and sends NMT start_node. EDS loading is externally
    /// driven and never happens here.
    pub fn start(&self) -> Result<(), CanOpenError> {
        let profile = self.get_device_profile_number()?;
        if let Some(operations) = profiles::operations(profile) {
            self.inner.operations.write().unwrap().extend(operations);
        }
        if let Some(constants) = profiles::constants(profile) {
            self.inner.constants.write().unwrap().extend(constants);
        }
        self.inner
            .nmt
            .send_nmt_message(self.inner.node_id.raw(), NmtCommandSpecifier::StartNode)
            .map_err(|e| {
                CanopenSnafu {
                    message: format!("Failed to send start_node: {e}"),
                }
                .build()
            })?;
        Ok(())
    }

    /// The device profile number: low 16 bits of the device type object
    pub fn get_device_profile_number(&self) -> Result<u16, CanOpenError> {
        let device_type = self.get_entry_at(0x1000, 0, ReadAccessMethod::UseDefault)?;
        let device_type = device_type.as_u32().map_err(|e| {
            CanopenSnafu {
                message: format!("Device type entry has unexpected type: {e}"),
            }
            .build()
        })?;
        Ok((device_type & 0xFFFF) as u16)
    }

    /// Returns true if the dictionary has an entry with this name
    pub fn has_entry(&self, entry_name: &str) -> bool {
        self.inner
            .entry_by_escaped_name(&utils::escape(entry_name))
            .is_some()
    }

    /// Returns true if the dictionary has an entry at this address
    pub fn has_entry_at(&self, index: u16, subindex: u8) -> bool {
        self.inner
            .entry_by_address(Address::new(index, subindex))
            .is_some()
    }

    /// The declared type of the named entry
    pub fn get_entry_type(&self, entry_name: &str) -> Result<DataType, CanOpenError> {
        Ok(self.resolve_name(entry_name)?.data_type)
    }

    /// The declared type of the entry at the given address
    pub fn get_entry_type_at(&self, index: u16, subindex: u8) -> Result<DataType, CanOpenError> {
        Ok(self.resolve_address(index, subindex)?.data_type)
    }

    /// Get the value of the named entry
    ///
    /// If the effective access method resolves to SDO, the cache is
    /// refreshed via SDO upload first. The effective method is
    /// `access_method`, or the entry's default when `UseDefault` is passed.
    /// A PDO-fed entry that has never been populated yields an invalid
    /// value; no SDO read is forced.
    pub fn get_entry(
        &self,
        entry_name: &str,
        access_method: ReadAccessMethod,
    ) -> Result<Value, CanOpenError> {
        let entry = self.resolve_name(entry_name)?;
        self.get_entry_resolved(entry, access_method)
    }

    /// Get the value of the entry at the given address
    pub fn get_entry_at(
        &self,
        index: u16,
        subindex: u8,
        access_method: ReadAccessMethod,
    ) -> Result<Value, CanOpenError> {
        let entry = self.resolve_address(index, subindex)?;
        self.get_entry_resolved(entry, access_method)
    }

    fn get_entry_resolved(
        &self,
        entry: Arc<Entry>,
        access_method: ReadAccessMethod,
    ) -> Result<Value, CanOpenError> {
        let via_sdo = access_method == ReadAccessMethod::Sdo
            || (access_method == ReadAccessMethod::UseDefault
                && entry.read_access_method == ReadAccessMethod::Sdo);
        if via_sdo {
            log::debug!("SDO update on read of '{}'", entry.name);
            let value = self.get_entry_via_sdo(entry.index, entry.subindex, entry.data_type)?;
            entry.set_value(value);
        }
        Ok(entry.get_value())
    }

    /// Set the value of the named entry
    ///
    /// The value's type must equal the entry's declared type. The local
    /// cache is updated first (firing value-changed observers if the value
    /// differs); if the effective access method resolves to SDO, an SDO
    /// download follows. On SDO failure the local value is NOT rolled back.
    pub fn set_entry(
        &self,
        entry_name: &str,
        value: Value,
        access_method: WriteAccessMethod,
    ) -> Result<(), CanOpenError> {
        let entry = self.resolve_name(entry_name)?;
        self.set_entry_resolved(entry, value, access_method)
    }

    /// Set the value of the entry at the given address
    pub fn set_entry_at(
        &self,
        index: u16,
        subindex: u8,
        value: Value,
        access_method: WriteAccessMethod,
    ) -> Result<(), CanOpenError> {
        let entry = self.resolve_address(index, subindex)?;
        self.set_entry_resolved(entry, value, access_method)
    }

    fn set_entry_resolved(
        &self,
        entry: Arc<Entry>,
        value: Value,
        access_method: WriteAccessMethod,
    ) -> Result<(), CanOpenError> {
        if value.data_type() != entry.data_type {
            return Err(DictionaryError::WrongType {
                entry: entry.name.clone(),
                expected: entry.data_type,
                got: value.data_type(),
            }
            .into());
        }
        entry.set_value(value.clone());
        let via_sdo = access_method == WriteAccessMethod::Sdo
            || (access_method == WriteAccessMethod::UseDefault
                && entry.write_access_method == WriteAccessMethod::Sdo);
        if via_sdo {
            log::debug!("SDO update on write of '{}'", entry.name);
            self.set_entry_via_sdo(entry.index, entry.subindex, &value)?;
        }
        Ok(())
    }

    /// Add an entry to the dictionary
    ///
    /// The name is normalized first. Fails without modifying the dictionary
    /// when an entry with the same name or the same address already exists.
    pub fn add_entry(
        &self,
        index: u16,
        subindex: u8,
        name: &str,
        data_type: DataType,
        access_type: AccessType,
    ) -> Result<(), CanOpenError> {
        let entry_name = utils::escape(name);
        let address = Address::new(index, subindex);
        let mut dictionary = self.inner.dictionary.write().unwrap();
        let mut name_index = self.inner.name_to_address.write().unwrap();
        if name_index.contains_key(&entry_name) {
            return CanopenSnafu {
                message: format!("Entry with name \"{entry_name}\" already exists"),
            }
            .fail();
        }
        if dictionary.contains_key(&address) {
            return CanopenSnafu {
                message: format!(
                    "Entry with index {} already exists",
                    utils::address_string(index, subindex)
                ),
            }
            .fail();
        }
        let entry = Arc::new(Entry::new(
            index,
            subindex,
            entry_name.clone(),
            data_type,
            access_type,
        ));
        dictionary.insert(address, entry);
        name_index.insert(entry_name, address);
        Ok(())
    }

    /// Read an entry directly via SDO, with retries on timeout
    ///
    /// Attempts up to `repeats_on_sdo_timeout + 1` times, sleeping the SDO
    /// response timeout between attempts. Abort and protocol errors
    /// propagate immediately without retry; exhausting the attempts raises
    /// a response timeout carrying the last underlying error.
    pub fn get_entry_via_sdo(
        &self,
        index: u16,
        subindex: u8,
        data_type: DataType,
    ) -> Result<Value, CanOpenError> {
        let attempts = self.inner.repeats_on_sdo_timeout + 1;
        let mut last_error = None;
        for attempt in 0..attempts {
            match self.inner.sdo.upload(self.inner.node_id, index, subindex) {
                Ok(bytes) => {
                    return Value::from_bytes(data_type, &bytes).map_err(|e| {
                        ProtocolSnafu {
                            message: format!(
                                "node {}: upload of {} returned unusable data: {e}",
                                self.inner.node_id,
                                utils::address_string(index, subindex)
                            ),
                        }
                        .build()
                        .into()
                    });
                }
                Err(e) if e.is_timeout() => {
                    log::debug!(
                        "SDO upload timeout on node {} ({}), repetition {} of {}",
                        self.inner.node_id,
                        utils::address_string(index, subindex),
                        attempt + 1,
                        attempts
                    );
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        std::thread::sleep(self.inner.sdo_response_timeout);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(self.retries_exhausted("get_entry_via_sdo", attempts, last_error))
    }

    /// Write an entry directly via SDO, with retries on timeout
    ///
    /// Same retry policy as [`get_entry_via_sdo`](Self::get_entry_via_sdo).
    pub fn set_entry_via_sdo(
        &self,
        index: u16,
        subindex: u8,
        value: &Value,
    ) -> Result<(), CanOpenError> {
        let attempts = self.inner.repeats_on_sdo_timeout + 1;
        let mut last_error = None;
        for attempt in 0..attempts {
            match self
                .inner
                .sdo
                .download(self.inner.node_id, index, subindex, value.bytes())
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_timeout() => {
                    log::debug!(
                        "SDO download timeout on node {} ({}), repetition {} of {}",
                        self.inner.node_id,
                        utils::address_string(index, subindex),
                        attempt + 1,
                        attempts
                    );
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        std::thread::sleep(self.inner.sdo_response_timeout);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(self.retries_exhausted("set_entry_via_sdo", attempts, last_error))
    }

    fn retries_exhausted(
        &self,
        what: &str,
        attempts: usize,
        last_error: Option<SdoError>,
    ) -> CanOpenError {
        ResponseTimeoutSnafu {
            message: format!(
                "{what} on node {} failed after {attempts} attempts. Last error: {}",
                self.inner.node_id,
                last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown".into())
            ),
        }
        .build()
        .into()
    }

    /// Map a window of an incoming PDO onto a dictionary entry
    ///
    /// Registers a dispatch callback with the core's PDO router which
    /// updates the entry's cached value (bypassing any SDO write) on every
    /// matching frame.
    pub fn add_receive_pdo_mapping(
        &self,
        cob_id: u16,
        entry_name: &str,
        offset: u8,
    ) -> Result<(), CanOpenError> {
        let mapping = self.push_receive_mapping(cob_id, entry_name, offset)?;
        let weak = Arc::downgrade(&self.inner);
        let handle = self.inner.pdo.add_pdo_received_callback(
            cob_id,
            Arc::new(move |data: &[u8]| {
                if let Some(device) = weak.upgrade() {
                    device.pdo_received(&mapping, data);
                }
            }),
        );
        self.inner
            .registered_pdo_callbacks
            .lock()
            .unwrap()
            .push((cob_id, handle));
        Ok(())
    }

    /// Map a window of an incoming PDO onto a custom callback
    ///
    /// Replaces the default dictionary update; the callback runs on the
    /// deferred callback worker, never on the receive thread.
    pub fn add_receive_pdo_mapping_with_callback(
        &self,
        cob_id: u16,
        entry_name: &str,
        offset: u8,
        callback: impl Fn(&ReceivePdoMapping, &[u8]) + Send + Sync + 'static,
    ) -> Result<(), CanOpenError> {
        let mapping = self.push_receive_mapping(cob_id, entry_name, offset)?;
        let callback = Arc::new(callback);
        let spawner = self.inner.spawner.clone();
        let handle = self.inner.pdo.add_pdo_received_callback(
            cob_id,
            Arc::new(move |data: &[u8]| {
                let callback = callback.clone();
                let mapping = mapping.clone();
                let data = data.to_vec();
                spawner.spawn(move || callback(&mapping, &data));
            }),
        );
        self.inner
            .registered_pdo_callbacks
            .lock()
            .unwrap()
            .push((cob_id, handle));
        Ok(())
    }

    fn push_receive_mapping(
        &self,
        cob_id: u16,
        entry_name: &str,
        offset: u8,
    ) -> Result<Arc<ReceivePdoMapping>, CanOpenError> {
        let name = utils::escape(entry_name);
        let entry = self.resolve_name(&name)?;
        let size = self.mappable_size(&entry)?;
        if offset as usize + size > 8 {
            return Err(MappingSizeSnafu {
                entry: name,
                offset,
                size,
            }
            .build()
            .into());
        }
        let mapping = Arc::new(ReceivePdoMapping {
            cob_id,
            entry_name: name,
            offset,
        });
        self.inner
            .receive_pdo_mappings
            .lock()
            .unwrap()
            .push(mapping.clone());
        Ok(mapping)
    }

    /// Create a transmit PDO from a set of entry mappings
    ///
    /// Validates that every referenced entry exists, that the windows fit
    /// into 8 bytes, and that no two windows overlap. `repeat_time` applies
    /// to [`TransmissionType::Periodic`] only; a zero repeat time is
    /// permitted but warned about, as it can overload the bus.
    pub fn add_transmit_pdo_mapping(
        &self,
        cob_id: u16,
        mappings: Vec<Mapping>,
        transmission_type: TransmissionType,
        repeat_time: Duration,
    ) -> Result<(), CanOpenError> {
        let mappings: Vec<Mapping> = mappings
            .into_iter()
            .map(|m| Mapping {
                entry_name: utils::escape(&m.entry_name),
                offset: m.offset,
            })
            .collect();
        self.check_mapping_correctness(&mappings)?;

        let pdo = Arc::new(TransmitPdoMapping {
            cob_id,
            transmission_type,
            repeat_time,
            mappings,
            device: Arc::downgrade(&self.inner),
            sender: self.inner.sender.clone(),
            pdo_router: self.inner.pdo.clone(),
            run_periodic_transmitter: AtomicBool::new(false),
            periodic_transmitter: Mutex::new(None),
            observer_ids: Mutex::new(Vec::new()),
            sync_handle: Mutex::new(None),
        });

        match transmission_type {
            TransmissionType::OnChange => {
                for mapping in &pdo.mappings {
                    // Entry exists because check_mapping_correctness passed
                    let entry = self.resolve_name(&mapping.entry_name)?;
                    let id = self.inner.next_callback_id.fetch_add(1, Ordering::Relaxed);
                    let weak_pdo = Arc::downgrade(&pdo);
                    let entry_name = mapping.entry_name.clone();
                    entry.add_value_changed_callback(
                        id,
                        Arc::new(move |value: &Value| {
                            log::debug!("Value of '{entry_name}' changed to {value}");
                            if let Some(pdo) = weak_pdo.upgrade() {
                                pdo.send();
                            }
                        }),
                    );
                    pdo.observer_ids
                        .lock()
                        .unwrap()
                        .push((entry.address(), id));
                }
            }
            TransmissionType::Periodic => {
                if repeat_time.is_zero() {
                    log::warn!("Repeat time is 0. This could overload the bus.");
                }
                pdo.run_periodic_transmitter.store(true, Ordering::SeqCst);
                let weak_pdo = Arc::downgrade(&pdo);
                let handle = std::thread::Builder::new()
                    .name(format!("canmaster-tpdo-{cob_id:x}"))
                    .spawn(move || loop {
                        let Some(pdo) = weak_pdo.upgrade() else { break };
                        if !pdo.run_periodic_transmitter.load(Ordering::SeqCst) {
                            break;
                        }
                        log::debug!("Sending periodic PDO with COB-ID {cob_id:#X}");
                        pdo.send();
                        let repeat_time = pdo.repeat_time;
                        drop(pdo);
                        std::thread::sleep(repeat_time);
                    })
                    .expect("failed to spawn periodic transmitter");
                *pdo.periodic_transmitter.lock().unwrap() = Some(handle);
            }
            TransmissionType::Sync => {
                let weak_pdo = Arc::downgrade(&pdo);
                let handle = self.inner.pdo.add_sync_callback(Arc::new(move || {
                    if let Some(pdo) = weak_pdo.upgrade() {
                        pdo.send();
                    }
                }));
                *pdo.sync_handle.lock().unwrap() = Some(handle);
            }
        }

        self.inner
            .transmit_pdo_mappings
            .lock()
            .unwrap()
            .push(pdo);
        Ok(())
    }

    /// Validate transmit mappings: existence, fit, and non-overlap
    fn check_mapping_correctness(&self, mappings: &[Mapping]) -> Result<(), CanOpenError> {
        let mut windows: Vec<(usize, usize)> = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            let entry = self.resolve_name(&mapping.entry_name)?;
            let size = self.mappable_size(&entry)?;
            let start = mapping.offset as usize;
            let end = start + size;
            if end > 8 {
                return Err(MappingSizeSnafu {
                    entry: mapping.entry_name.clone(),
                    offset: mapping.offset,
                    size,
                }
                .build()
                .into());
            }
            if windows.iter().any(|&(b0, b1)| start < b1 && b0 < end) {
                return Err(MappingOverlapSnafu {
                    entry: mapping.entry_name.clone(),
                }
                .build()
                .into());
            }
            windows.push((start, end));
        }
        Ok(())
    }

    fn mappable_size(&self, entry: &Entry) -> Result<usize, CanOpenError> {
        entry.data_type.size().ok_or_else(|| {
            CanopenSnafu {
                message: format!(
                    "Entry \"{}\" has no fixed size and cannot be PDO-mapped",
                    entry.name
                ),
            }
            .build()
        })
    }

    /// Start the heartbeat producer thread
    ///
    /// Emits a heartbeat frame for `node_id` every `interval` until the
    /// device is dropped or [`stop_heartbeat`](Self::stop_heartbeat) is
    /// called. Does nothing on a zero interval or when already running.
    pub fn start_heartbeat(&self, node_id: u8, interval: Duration, rtr: bool, state: NmtState) {
        if interval.is_zero() {
            return;
        }
        let mut thread = self.inner.heartbeat_thread.lock().unwrap();
        if thread.is_some() {
            return;
        }
        let sender = self.inner.sender.clone();
        let terminating = self.inner.terminating.clone();
        let cob_id = CanId::std(constants::HEARTBEAT_BASE + node_id as u16);
        let handle = std::thread::Builder::new()
            .name(format!("canmaster-heartbeat-{node_id}"))
            .spawn(move || {
                let msg = if rtr {
                    CanMessage::new_rtr(cob_id)
                } else {
                    CanMessage::new(cob_id, &[state as u8])
                };
                while !terminating.load(Ordering::SeqCst) {
                    if sender.send(msg).is_err() {
                        log::warn!("Failed to send heartbeat for node {node_id}");
                    }
                    std::thread::sleep(interval);
                }
            })
            .expect("failed to spawn heartbeat producer");
        *thread = Some(handle);
    }

    /// Stop the heartbeat producer and join its thread
    ///
    /// Sets the device's terminating flag, so every other background
    /// resource of this device winds down too.
    pub fn stop_heartbeat(&self) {
        self.inner.terminating.store(true, Ordering::SeqCst);
        if let Some(handle) = self.inner.heartbeat_thread.lock().unwrap().take() {
            if handle.join().is_err() {
                log::error!("Heartbeat producer panicked");
            }
        }
    }

    /// Execute a named profile operation
    pub fn execute(&self, operation_name: &str, argument: &Value) -> Result<Value, CanOpenError> {
        let name = utils::escape(operation_name);
        let operation = {
            let operations = self.inner.operations.read().unwrap();
            operations.get(&name).cloned()
        };
        match operation {
            Some(operation) => operation(self, argument),
            None => Err(UnknownOperationSnafu { name }.build().into()),
        }
    }

    /// Register an operation, overwriting (with a warning) any existing one
    pub fn add_operation(&self, operation_name: &str, operation: Operation) {
        let name = utils::escape(operation_name);
        let mut operations = self.inner.operations.write().unwrap();
        if operations.insert(name.clone(), operation).is_some() {
            log::warn!("Overwriting operation \"{name}\"");
        }
    }

    /// Get a named profile constant
    pub fn get_constant(&self, constant_name: &str) -> Result<Value, CanOpenError> {
        let name = utils::escape(constant_name);
        self.inner
            .constants
            .read()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or_else(|| UnknownConstantSnafu { name }.build().into())
    }

    /// Register a constant, overwriting (with a warning) any existing one
    pub fn add_constant(&self, constant_name: &str, constant: Value) {
        let name = utils::escape(constant_name);
        let mut constants = self.inner.constants.write().unwrap();
        if constants.insert(name.clone(), constant).is_some() {
            log::warn!("Overwriting constant \"{name}\"");
        }
    }

    /// Probe every dictionary entry via SDO, disabling unreadable ones
    pub fn read_complete_dictionary(&self) {
        let entries: Vec<Arc<Entry>> = self
            .inner
            .dictionary
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for entry in entries {
            if entry.is_disabled() {
                continue;
            }
            if let Err(e) = self.get_entry(&entry.name, ReadAccessMethod::UseDefault) {
                entry.disabled.store(true, Ordering::Relaxed);
                log::debug!("SDO error for field '{}': {e} -> disable entry", entry.name);
            }
        }
    }

    /// Remove every entry and name mapping
    ///
    /// Used by the EDS loader when a full re-import is requested. PDO
    /// mappings referencing removed entries become inert (they resolve by
    /// name on each event and log when resolution fails).
    pub fn clear_dictionary(&self) {
        let mut dictionary = self.inner.dictionary.write().unwrap();
        let mut name_index = self.inner.name_to_address.write().unwrap();
        dictionary.clear();
        name_index.clear();
    }

    /// All entries, sorted by address, skipping disabled ones
    pub fn entries(&self) -> Vec<Arc<Entry>> {
        let mut entries: Vec<Arc<Entry>> = self
            .inner
            .dictionary
            .read()
            .unwrap()
            .values()
            .filter(|e| !e.is_disabled())
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.address());
        entries
    }

    /// Reconfigure one of the slave's transmit PDOs via SDO
    ///
    /// `entries_to_map` are packed 32-bit mapping records
    /// (index << 16 | subindex << 8 | bit length). The PDO is disabled (COB
    /// ID bit 31 set) for the duration of the rewrite and re-enabled at the
    /// end. Any SDO failure aborts the remainder of the sequence.
    pub fn map_tpdo_in_device(
        &self,
        tpdo_no: TpdoNo,
        entries_to_map: &[u32],
        transmit_type: u8,
        inhibit_time: Option<u16>,
        event_timer: Option<u16>,
    ) -> Result<(), CanOpenError> {
        let (comm_param_idx, mapp_param_idx) = tpdo_no.indexes();
        self.rewrite_pdo_params(
            comm_param_idx,
            mapp_param_idx,
            entries_to_map,
            transmit_type,
            inhibit_time,
            event_timer,
        )
    }

    /// Reconfigure one of the slave's receive PDOs via SDO
    ///
    /// Same sequence as [`map_tpdo_in_device`](Self::map_tpdo_in_device),
    /// minus the event timer, which only exists for TPDOs.
    pub fn map_rpdo_in_device(
        &self,
        rpdo_no: RpdoNo,
        entries_to_map: &[u32],
        transmit_type: u8,
        inhibit_time: Option<u16>,
    ) -> Result<(), CanOpenError> {
        let (comm_param_idx, mapp_param_idx) = rpdo_no.indexes();
        self.rewrite_pdo_params(
            comm_param_idx,
            mapp_param_idx,
            entries_to_map,
            transmit_type,
            inhibit_time,
            None,
        )
    }

    fn rewrite_pdo_params(
        &self,
        comm_param_idx: u16,
        mapp_param_idx: u16,
        entries_to_map: &[u32],
        transmit_type: u8,
        inhibit_time: Option<u16>,
        event_timer: Option<u16>,
    ) -> Result<(), CanOpenError> {
        // Disable the PDO while its mapping is inconsistent
        let cob_id = self
            .get_entry_via_sdo(comm_param_idx, 0x01, DataType::UInt32)?
            .as_u32()
            .map_err(|e| {
                CanopenSnafu {
                    message: format!("PDO COB-ID entry has unexpected type: {e}"),
                }
                .build()
            })?;
        self.set_entry_via_sdo(comm_param_idx, 0x01, &Value::from(cob_id | (1 << 31)))?;

        // Clear the mapping count, write the new records, then the count
        self.set_entry_via_sdo(mapp_param_idx, 0x00, &Value::from(0u8))?;
        for (i, record) in entries_to_map.iter().enumerate() {
            self.set_entry_via_sdo(mapp_param_idx, (i + 1) as u8, &Value::from(*record))?;
        }
        self.set_entry_via_sdo(
            mapp_param_idx,
            0x00,
            &Value::from(entries_to_map.len() as u8),
        )?;

        self.set_entry_via_sdo(comm_param_idx, 0x02, &Value::from(transmit_type))?;
        if let Some(inhibit_time) = inhibit_time {
            self.set_entry_via_sdo(comm_param_idx, 0x03, &Value::from(inhibit_time))?;
        }
        if let Some(event_timer) = event_timer {
            self.set_entry_via_sdo(comm_param_idx, 0x05, &Value::from(event_timer))?;
        }

        // Re-enable
        self.set_entry_via_sdo(comm_param_idx, 0x01, &Value::from(cob_id & !(1 << 31)))?;
        Ok(())
    }

    fn resolve_name(&self, entry_name: &str) -> Result<Arc<Entry>, CanOpenError> {
        let name = utils::escape(entry_name);
        self.inner
            .entry_by_escaped_name(&name)
            .ok_or_else(|| UnknownEntrySnafu { entry: name }.build().into())
    }

    fn resolve_address(&self, index: u16, subindex: u8) -> Result<Arc<Entry>, CanOpenError> {
        self.inner
            .entry_by_address(Address::new(index, subindex))
            .ok_or_else(|| {
                UnknownEntrySnafu {
                    entry: utils::address_string(index, subindex),
                }
                .build()
                .into()
            })
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.stop_heartbeat();
        let callbacks: Vec<_> = self
            .inner
            .registered_pdo_callbacks
            .lock()
            .unwrap()
            .drain(..)
            .collect();
        for (cob_id, handle) in callbacks {
            self.inner.pdo.remove_pdo_received_callback(cob_id, handle);
        }
        // Transmit mappings stop their timers and observers on drop
        self.inner.transmit_pdo_mappings.lock().unwrap().clear();
        self.inner.receive_pdo_mappings.lock().unwrap().clear();
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("node_id", &self.inner.node_id)
            .field(
                "entries",
                &self.inner.dictionary.read().unwrap().len(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::channel_pair;
    use crate::MasterConfig;

    fn make_device() -> (Core, Device) {
        let (sender, receiver) = channel_pair();
        let core = Core::new(sender, receiver, MasterConfig::default());
        let device = Device::new(&core, NodeId::new(1).unwrap());
        (core, device)
    }

    fn motion_dictionary(device: &Device) {
        device
            .add_entry(
                0x6064,
                0,
                "Position Actual Value",
                DataType::Int32,
                AccessType::ReadOnly,
            )
            .unwrap();
        device
            .add_entry(
                0x6041,
                0,
                "Statusword",
                DataType::UInt16,
                AccessType::ReadOnly,
            )
            .unwrap();
        device
            .add_entry(
                0x60FF,
                0,
                "Target Velocity",
                DataType::Int32,
                AccessType::ReadWrite,
            )
            .unwrap();
    }

    #[test]
    fn add_entry_rejects_duplicates_and_leaves_dictionary_unchanged() {
        let (_core, device) = make_device();
        motion_dictionary(&device);
        assert_eq!(3, device.entries().len());

        // Same name, different address
        let err = device
            .add_entry(0x2000, 0, "statusword", DataType::UInt16, AccessType::ReadOnly)
            .unwrap_err();
        assert!(matches!(err, CanOpenError::Canopen { .. }));

        // Same address, different name
        let err = device
            .add_entry(0x6041, 0, "other_name", DataType::UInt16, AccessType::ReadOnly)
            .unwrap_err();
        assert!(matches!(err, CanOpenError::Canopen { .. }));

        assert_eq!(3, device.entries().len());
        assert!(!device.has_entry("other_name"));
    }

    #[test]
    fn name_index_and_dictionary_stay_consistent() {
        let (_core, device) = make_device();
        motion_dictionary(&device);
        for entry in device.entries() {
            let found = device
                .get_entry_type(&entry.name)
                .expect("name index points at a live entry");
            assert_eq!(entry.data_type, found);
        }
    }

    #[test]
    fn lookups_normalize_names() {
        let (_core, device) = make_device();
        motion_dictionary(&device);
        assert!(device.has_entry("Position Actual Value"));
        assert!(device.has_entry("position_actual_value"));
        assert!(device.has_entry("POSITION-ACTUAL-VALUE"));
        assert_eq!(
            DataType::Int32,
            device.get_entry_type("Position Actual Value").unwrap()
        );
    }

    #[test]
    fn unknown_entry_is_reported() {
        let (_core, device) = make_device();
        let err = device
            .get_entry("no_such_thing", ReadAccessMethod::Cache)
            .unwrap_err();
        assert!(matches!(
            err,
            CanOpenError::Dictionary {
                source: DictionaryError::UnknownEntry { .. }
            }
        ));
    }

    #[test]
    fn cached_read_of_unpopulated_entry_returns_invalid() {
        let (_core, device) = make_device();
        motion_dictionary(&device);
        let value = device
            .get_entry("statusword", ReadAccessMethod::Cache)
            .unwrap();
        assert!(value.is_invalid());
    }

    #[test]
    fn set_entry_validates_type() {
        let (_core, device) = make_device();
        motion_dictionary(&device);
        let err = device
            .set_entry(
                "target_velocity",
                Value::from(1000u16),
                WriteAccessMethod::Pdo,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CanOpenError::Dictionary {
                source: DictionaryError::WrongType { .. }
            }
        ));

        device
            .set_entry(
                "target_velocity",
                Value::from(1000i32),
                WriteAccessMethod::Pdo,
            )
            .unwrap();
        assert_eq!(
            1000,
            device
                .get_entry("target_velocity", ReadAccessMethod::Cache)
                .unwrap()
                .as_i32()
                .unwrap()
        );
    }

    #[test]
    fn receive_mapping_boundary() {
        let (_core, device) = make_device();
        motion_dictionary(&device);

        // int32 at offset 4: offset + size == 8, allowed
        device
            .add_receive_pdo_mapping(0x181, "position_actual_value", 4)
            .unwrap();
        // offset + size == 9, rejected
        let err = device
            .add_receive_pdo_mapping(0x181, "position_actual_value", 5)
            .unwrap_err();
        assert!(matches!(
            err,
            CanOpenError::Dictionary {
                source: DictionaryError::MappingSize { .. }
            }
        ));
    }

    #[test]
    fn transmit_mapping_rejects_overlap_and_oversize() {
        let (_core, device) = make_device();
        motion_dictionary(&device);

        let err = device
            .add_transmit_pdo_mapping(
                0x201,
                vec![
                    Mapping {
                        entry_name: "target_velocity".into(),
                        offset: 0,
                    },
                    Mapping {
                        entry_name: "statusword".into(),
                        offset: 2,
                    },
                ],
                TransmissionType::OnChange,
                Duration::ZERO,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CanOpenError::Dictionary {
                source: DictionaryError::MappingOverlap { .. }
            }
        ));

        let err = device
            .add_transmit_pdo_mapping(
                0x201,
                vec![Mapping {
                    entry_name: "target_velocity".into(),
                    offset: 6,
                }],
                TransmissionType::OnChange,
                Duration::ZERO,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CanOpenError::Dictionary {
                source: DictionaryError::MappingSize { .. }
            }
        ));
    }

    #[test]
    fn unknown_operation_and_constant() {
        let (_core, device) = make_device();
        let err = device.execute("warp_drive", &Value::invalid()).unwrap_err();
        assert!(matches!(
            err,
            CanOpenError::Dictionary {
                source: DictionaryError::UnknownOperation { .. }
            }
        ));
        let err = device.get_constant("answer").unwrap_err();
        assert!(matches!(
            err,
            CanOpenError::Dictionary {
                source: DictionaryError::UnknownConstant { .. }
            }
        ));
    }

    #[test]
    fn operations_and_constants_are_callable() {
        let (_core, device) = make_device();
        motion_dictionary(&device);
        device.add_constant("Max Velocity", Value::from(5000i32));
        device.add_operation(
            "double",
            Arc::new(|_, argument| Ok(Value::from(argument.as_i32().unwrap() * 2))),
        );
        assert_eq!(
            5000,
            device.get_constant("max_velocity").unwrap().as_i32().unwrap()
        );
        let result = device.execute("Double", &Value::from(21i32)).unwrap();
        assert_eq!(42, result.as_i32().unwrap());
    }

    #[test]
    fn tpdo_indexes() {
        assert_eq!((0x1800, 0x1A00), TpdoNo::Tpdo1.indexes());
        assert_eq!((0x1803, 0x1A03), TpdoNo::Tpdo4.indexes());
        assert_eq!((0x1400, 0x1600), RpdoNo::Rpdo1.indexes());
        assert_eq!((0x1402, 0x1602), RpdoNo::Rpdo3.indexes());
        assert!(TpdoNo::from_number(4).is_none());
    }
}

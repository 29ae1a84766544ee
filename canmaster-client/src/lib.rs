//! A CANopen master library
//!
//! This crate makes a remote CANopen slave look like an addressable, typed,
//! cached object store. The building blocks:
//!
//! - A [`Core`] which owns the CAN driver, runs the receive thread, and
//!   dispatches incoming frames to the SDO, PDO and NMT subsystems
//! - A blocking [SDO engine](sdo::SdoEngine) for reading and writing a
//!   slave's object dictionary, with per-node transaction locking
//! - A [PDO router](pdo::PdoRouter) demultiplexing incoming process data
//!   frames into registered callbacks
//! - An [NMT layer](nmt::NmtLayer) for lifecycle commands, heartbeat
//!   consumption and device liveness supervision
//! - A per-slave [`Device`] holding the typed object dictionary, PDO
//!   mappings, profile operations, and remote PDO reconfiguration flows
//!
//! The library is thread-based: SDO calls block the calling thread, periodic
//! PDO transmitters and heartbeat producers own dedicated timer threads, and
//! user callbacks are dispatched off the receive path.

mod config;
mod core;
mod device;
mod eds;
mod entry;
mod error;
mod executor;
pub mod nmt;
mod node_config;
pub mod pdo;
mod pdo_mapping;
mod profiles;
pub mod sdo;
#[cfg(test)]
mod test_helpers;
mod utils;

pub use canmaster_common as common;

pub use crate::core::{Core, SharedSender};
pub use config::MasterConfig;
pub use device::{Device, Operation, RpdoNo, TpdoNo};
pub use eds::{load_eds_file, load_eds_str, EdsError, EdsLoadOptions};
pub use entry::{AccessType, Address, Entry, ReadAccessMethod, WriteAccessMethod};
pub use error::{CanOpenError, DictionaryError, SdoError};
pub use nmt::{DeviceState, NmtLayer};
pub use node_config::{ConfigError, NodeConfig, PdoConfig, PdoMappingEntry, Store};
pub use pdo_mapping::{Mapping, ReceivePdoMapping, TransmissionType, TransmitPdoMapping};

//! Per-profile operations and constants
//!
//! Installed by [`Device::start`](crate::Device::start) based on the device
//! profile number. Currently covers a subset of CiA 402 (drives and motion
//! control); applications can register their own via
//! [`Device::add_operation`](crate::Device::add_operation).

use std::collections::HashMap;
use std::sync::Arc;

use canmaster_common::Value;

use crate::device::Operation;
use crate::entry::WriteAccessMethod;

const PROFILE_402: u16 = 402;

pub(crate) fn operations(profile: u16) -> Option<HashMap<String, Operation>> {
    match profile {
        PROFILE_402 => Some(profile_402_operations()),
        _ => None,
    }
}

pub(crate) fn constants(profile: u16) -> Option<HashMap<String, Value>> {
    match profile {
        PROFILE_402 => Some(profile_402_constants()),
        _ => None,
    }
}

fn write_controlword(
    device: &crate::Device,
    word: u16,
) -> Result<Value, crate::error::CanOpenError> {
    let value = Value::from(word);
    device.set_entry("controlword", value.clone(), WriteAccessMethod::Sdo)?;
    Ok(value)
}

fn profile_402_operations() -> HashMap<String, Operation> {
    let mut operations: HashMap<String, Operation> = HashMap::new();
    operations.insert(
        "enable_operation".into(),
        Arc::new(|device, _| {
            // CiA 402 state machine: shutdown, switch on, enable
            write_controlword(device, 0x0006)?;
            write_controlword(device, 0x0007)?;
            write_controlword(device, 0x000F)
        }),
    );
    operations.insert(
        "disable_operation".into(),
        Arc::new(|device, _| write_controlword(device, 0x0006)),
    );
    operations.insert(
        "fault_reset".into(),
        Arc::new(|device, _| write_controlword(device, 0x0080)),
    );
    operations
}

fn profile_402_constants() -> HashMap<String, Value> {
    let mut constants = HashMap::new();
    constants.insert("controlword_shutdown".into(), Value::from(0x0006u16));
    constants.insert("controlword_switch_on".into(), Value::from(0x0007u16));
    constants.insert(
        "controlword_enable_operation".into(),
        Value::from(0x000Fu16),
    );
    constants.insert("controlword_quick_stop".into(), Value::from(0x0002u16));
    constants.insert("controlword_fault_reset".into(), Value::from(0x0080u16));
    constants
}

//! Object dictionary entries

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use canmaster_common::{DataType, Value};

/// A dictionary address: object index plus subindex
///
/// Ordered lexicographically by (index, subindex).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    /// 16-bit object index
    pub index: u16,
    /// 8-bit subindex
    pub subindex: u8,
}

impl Address {
    /// Create an address
    pub fn new(index: u16, subindex: u8) -> Self {
        Self { index, subindex }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06X}sub{}", self.index, self.subindex)
    }
}

/// Declared access rights of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// Readable only
    ReadOnly,
    /// Writable only
    WriteOnly,
    /// Readable and writable
    ReadWrite,
    /// Readable, and never changed even by the device itself
    Constant,
}

/// How a read should be satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAccessMethod {
    /// Refresh the cache via SDO upload, then return it
    Sdo,
    /// Entry is fed by a receive PDO; return the cache
    Pdo,
    /// Return the cache without touching the bus
    Cache,
    /// Resolve through the entry's default read method
    UseDefault,
}

/// How a write should be propagated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAccessMethod {
    /// Store locally, then SDO download to the slave
    Sdo,
    /// Entry is carried by a transmit PDO; store locally only
    Pdo,
    /// Resolve through the entry's default write method
    UseDefault,
}

pub(crate) type ValueChangedCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// One object in a device's dictionary
///
/// The current value starts out invalid and is populated by SDO reads,
/// receive PDOs, or local writes. The value's type tag, when not invalid,
/// always equals the entry's declared type.
pub struct Entry {
    /// Object index
    pub index: u16,
    /// Subindex
    pub subindex: u8,
    /// Normalized symbolic name
    pub name: String,
    /// Declared type
    pub data_type: DataType,
    /// Declared access rights
    pub access_type: AccessType,
    /// Default method for reads with [`ReadAccessMethod::UseDefault`]
    pub read_access_method: ReadAccessMethod,
    /// Default method for writes with [`WriteAccessMethod::UseDefault`]
    pub write_access_method: WriteAccessMethod,
    /// Set when an SDO probe of this entry failed; skipped by bulk reads
    pub disabled: AtomicBool,
    value: Mutex<Value>,
    value_changed_callbacks: Mutex<Vec<(u64, ValueChangedCallback)>>,
}

impl Entry {
    pub(crate) fn new(
        index: u16,
        subindex: u8,
        name: String,
        data_type: DataType,
        access_type: AccessType,
    ) -> Self {
        Self {
            index,
            subindex,
            name,
            data_type,
            access_type,
            read_access_method: ReadAccessMethod::Sdo,
            write_access_method: WriteAccessMethod::Sdo,
            disabled: AtomicBool::new(false),
            value: Mutex::new(Value::invalid()),
            value_changed_callbacks: Mutex::new(Vec::new()),
        }
    }

    /// The entry's address
    pub fn address(&self) -> Address {
        Address::new(self.index, self.subindex)
    }

    /// Get a copy of the current cached value (may be invalid)
    pub fn get_value(&self) -> Value {
        self.value.lock().unwrap().clone()
    }

    /// Store a new value, firing value-changed callbacks if it differs
    ///
    /// Callbacks run on the calling thread. Both the value lock and the
    /// observer list lock are released before any callback is invoked, so
    /// callbacks may read the dictionary and observers may be added or
    /// removed concurrently.
    pub fn set_value(&self, value: Value) {
        let changed = {
            let mut current = self.value.lock().unwrap();
            let changed = *current != value;
            *current = value.clone();
            changed
        };
        if changed {
            let callbacks: Vec<ValueChangedCallback> = self
                .value_changed_callbacks
                .lock()
                .unwrap()
                .iter()
                .map(|(_, callback)| callback.clone())
                .collect();
            for callback in callbacks {
                callback(&value);
            }
        }
    }

    /// Returns true if this entry has been probed and found unreadable
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub(crate) fn add_value_changed_callback(&self, id: u64, callback: ValueChangedCallback) {
        self.value_changed_callbacks
            .lock()
            .unwrap()
            .push((id, callback));
    }

    pub(crate) fn remove_value_changed_callback(&self, id: u64) {
        self.value_changed_callbacks
            .lock()
            .unwrap()
            .retain(|(cb_id, _)| *cb_id != id);
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("address", &self.address())
            .field("name", &self.name)
            .field("data_type", &self.data_type)
            .field("access_type", &self.access_type)
            .field("value", &self.get_value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn value_changed_fires_only_on_change() {
        let entry = Entry::new(
            0x6040,
            0,
            "controlword".into(),
            DataType::UInt16,
            AccessType::ReadWrite,
        );
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        entry.add_value_changed_callback(
            1,
            Arc::new(move |_: &Value| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        entry.set_value(Value::from(0x000Fu16));
        entry.set_value(Value::from(0x000Fu16));
        assert_eq!(1, count.load(Ordering::SeqCst));

        entry.set_value(Value::from(0x0006u16));
        assert_eq!(2, count.load(Ordering::SeqCst));
    }

    #[test]
    fn removed_callback_stops_firing() {
        let entry = Entry::new(
            0x6041,
            0,
            "statusword".into(),
            DataType::UInt16,
            AccessType::ReadOnly,
        );
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        entry.add_value_changed_callback(
            7,
            Arc::new(move |_: &Value| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        entry.set_value(Value::from(1u16));
        entry.remove_value_changed_callback(7);
        entry.set_value(Value::from(2u16));
        assert_eq!(1, count.load(Ordering::SeqCst));
    }
}

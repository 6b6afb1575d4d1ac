//! Device records, the paired-device cache used for name resolution, and the last connected address.

use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

/// Opaque transport address (hardware address, `ip:port`, ...). The core never parses it.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TransportAddress(String);

impl TransportAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        TransportAddress(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransportAddress {
    fn from(s: &str) -> Self {
        TransportAddress(s.to_owned())
    }
}

/// A discovered or paired device. Immutable once produced by discovery.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
    pub address: TransportAddress,
}

impl DeviceRecord {
    pub fn new(name: impl Into<String>, address: impl Into<TransportAddress>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// Name shown to the user; falls back to the address for unnamed devices.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            self.address.as_str()
        } else {
            &self.name
        }
    }
}

/// Cached set of discovered/paired devices. Cloning shares the same cache.
#[derive(Debug, Clone, Default)]
pub struct PairedDevices {
    inner: Arc<RwLock<Vec<DeviceRecord>>>,
}

impl PairedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        let devices = Self::new();
        for r in records {
            devices.insert(r);
        }
        devices
    }

    /// Add a record unless one with the same address is already cached. Returns true if added.
    pub fn insert(&self, record: DeviceRecord) -> bool {
        let Ok(mut list) = self.inner.write() else {
            return false;
        };
        if list.iter().any(|r| r.address == record.address) {
            return false;
        }
        list.push(record);
        true
    }

    /// First record whose name matches exactly. Linear scan; paired sets are small.
    pub fn find_by_name(&self, name: &str) -> Option<DeviceRecord> {
        let list = self.inner.read().ok()?;
        list.iter().find(|r| r.name == name).cloned()
    }

    /// Address of the first record named `name`. Absence is a valid result, not an error.
    pub fn resolve(&self, name: &str) -> Option<TransportAddress> {
        self.find_by_name(name).map(|r| r.address)
    }

    pub fn records(&self) -> Vec<DeviceRecord> {
        self.inner.read().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Address of the most recently connected device. Set on every successful connect,
/// last writer wins, never expires.
#[derive(Debug, Clone, Default)]
pub struct LastDeviceAddress {
    inner: Arc<RwLock<Option<TransportAddress>>>,
}

impl LastDeviceAddress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, addr: TransportAddress) {
        if let Ok(mut slot) = self.inner.write() {
            *slot = Some(addr);
        }
    }

    pub fn get(&self) -> Option<TransportAddress> {
        self.inner.read().ok().and_then(|s| s.clone())
    }
}

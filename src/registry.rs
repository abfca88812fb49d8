//! External device registry and lease store.
//!
//! The transaction handler only sees the [`DeviceStore`] trait. The registry
//! decides a client's classification and keeps the audit trail of confirmed
//! leases; the in-memory pools stay the authority on who holds which address.

use std::{
    net::Ipv4Addr,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use advmac::MacAddr6;
use compact_str::CompactString;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Classification;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(CompactString),
    #[error("store rejected write: {0}")]
    Rejected(CompactString),
}

pub fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Device {
    pub mac: MacAddr6,
    #[serde(default)]
    pub username: CompactString,
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub blacklisted: bool,
    /// Registration expiry in unix seconds, 0 never expires.
    #[serde(default)]
    pub expires: u64,
    #[serde(default)]
    pub last_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub lease_expires: u64,
    #[serde(default)]
    pub last_seen: u64,
}

impl Device {
    pub fn new(mac: MacAddr6) -> Self {
        Self {
            mac,
            username: CompactString::default(),
            registered: false,
            blacklisted: false,
            expires: 0,
            last_ip: None,
            lease_expires: 0,
            last_seen: 0,
        }
    }

    pub fn is_registered(&self, now: SystemTime) -> bool {
        self.registered && !self.blacklisted && (self.expires == 0 || self.expires > unix_secs(now))
    }

    pub fn classification(&self, now: SystemTime) -> Classification {
        if self.is_registered(now) {
            Classification::Registered
        } else {
            Classification::Unregistered
        }
    }
}

/// One confirmed lease, keyed by (mac, start).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub ip: Ipv4Addr,
    pub mac: MacAddr6,
    pub network: CompactString,
    pub classification: Classification,
    pub start: u64,
    pub end: u64,
}

pub trait DeviceStore: Send + Sync {
    /// `Ok(None)` when the registry does not know the hardware address.
    fn device(&self, mac: MacAddr6) -> std::result::Result<Option<Device>, StoreError>;

    fn upsert_device(&self, device: &Device) -> std::result::Result<(), StoreError>;

    fn insert_lease(&self, lease: &LeaseRecord) -> std::result::Result<(), StoreError>;
}

/// Registry held entirely in memory, seeded from a JSON device list.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    devices: DashMap<MacAddr6, Device>,
    leases: DashMap<(MacAddr6, u64), LeaseRecord>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device: Device) {
        self.devices.insert(device.mac, device);
    }

    pub fn load_devices(&self, devices: Vec<Device>) {
        for device in devices.into_iter() {
            self.insert(device);
        }
    }

    /// Read a JSON array of devices.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let devices: Vec<Device> = serde_json::from_reader(std::io::BufReader::new(file))?;
        let registry = Self::new();
        let count = devices.len();
        registry.load_devices(devices);
        info!(path = %path.as_ref().display(), count, "loaded device registry");
        Ok(registry)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }

    pub fn leases_for(&self, mac: MacAddr6) -> Vec<LeaseRecord> {
        let mut leases: Vec<_> = self
            .leases
            .iter()
            .filter(|entry| entry.key().0 == mac)
            .map(|entry| entry.value().clone())
            .collect();
        leases.sort_by_key(|lease| lease.start);
        leases
    }
}

impl DeviceStore for MemoryRegistry {
    fn device(&self, mac: MacAddr6) -> std::result::Result<Option<Device>, StoreError> {
        Ok(self.devices.get(&mac).map(|d| d.value().clone()))
    }

    fn upsert_device(&self, device: &Device) -> std::result::Result<(), StoreError> {
        self.devices.insert(device.mac, device.clone());
        Ok(())
    }

    fn insert_lease(&self, lease: &LeaseRecord) -> std::result::Result<(), StoreError> {
        self.leases.insert((lease.mac, lease.start), lease.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const DEVICES: &str = r#"
    [
        {
            "mac": "12-34-56-12-34-56",
            "username": "alice",
            "registered": true
        },
        {
            "mac": "00-11-22-33-44-55",
            "username": "bob",
            "registered": true,
            "blacklisted": true
        },
        {
            "mac": "00-11-22-33-44-57",
            "username": "carol",
            "registered": true,
            "expires": 1700000000
        },
        {
            "mac": "00-11-22-33-44-58"
        }
    ]
    "#;

    fn registry() -> MemoryRegistry {
        let devices: Vec<Device> = serde_json::from_str(DEVICES).unwrap();
        let registry = MemoryRegistry::new();
        registry.load_devices(devices);
        registry
    }

    #[test]
    fn device_lookups() {
        let registry = registry();
        assert_eq!(registry.device_count(), 4);

        let alice = registry
            .device(MacAddr6::new([0x12, 0x34, 0x56, 0x12, 0x34, 0x56]))
            .unwrap()
            .unwrap();
        assert_eq!(alice.username, "alice");
        assert_eq!(alice.last_ip, None);

        assert!(registry
            .device(MacAddr6::new([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn classification_rules() {
        let registry = registry();
        let before = UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        let after = UNIX_EPOCH + Duration::from_secs(1_800_000_000);
        let class = |mac: &str, now| {
            registry
                .device(mac.parse().unwrap())
                .unwrap()
                .unwrap()
                .classification(now)
        };

        assert_eq!(class("12-34-56-12-34-56", after), Classification::Registered);
        assert_eq!(class("00-11-22-33-44-55", before), Classification::Unregistered);
        assert_eq!(class("00-11-22-33-44-57", before), Classification::Registered);
        assert_eq!(class("00-11-22-33-44-57", after), Classification::Unregistered);
        assert_eq!(class("00-11-22-33-44-58", before), Classification::Unregistered);
    }

    #[test]
    fn lease_records_are_keyed_by_mac_and_start() {
        let registry = MemoryRegistry::new();
        let mac = MacAddr6::new([0x12, 0x34, 0x56, 0x12, 0x34, 0x56]);
        let record = |start| LeaseRecord {
            ip: Ipv4Addr::new(10, 0, 2, 10),
            mac,
            network: "Network1".into(),
            classification: Classification::Registered,
            start,
            end: start + 86400,
        };

        registry.insert_lease(&record(200)).unwrap();
        registry.insert_lease(&record(100)).unwrap();
        registry.insert_lease(&record(100)).unwrap();

        assert_eq!(registry.lease_count(), 2);
        let starts: Vec<_> = registry.leases_for(mac).iter().map(|l| l.start).collect();
        assert_eq!(starts, vec![100, 200]);
    }

    #[test]
    fn upsert_replaces_device() {
        let registry = registry();
        let mac = MacAddr6::new([0x12, 0x34, 0x56, 0x12, 0x34, 0x56]);
        let mut device = registry.device(mac).unwrap().unwrap();
        device.last_ip = Some(Ipv4Addr::new(10, 0, 2, 10));
        device.last_seen = 42;
        registry.upsert_device(&device).unwrap();

        assert_eq!(registry.device(mac).unwrap(), Some(device));
        assert_eq!(registry.device_count(), 4);
    }

    #[test]
    fn unix_secs_before_epoch_is_zero() {
        assert_eq!(unix_secs(UNIX_EPOCH), 0);
        assert_eq!(unix_secs(UNIX_EPOCH + Duration::from_secs(5)), 5);
    }
}

//! In-memory device registry.
//!
//! The registry is the only mutable state shared between the inventory
//! stream loops and the allocation handler. It owns the backing map
//! exclusively; other components interact through [`DeviceRegistry::refresh`],
//! [`DeviceRegistry::snapshot`] and [`DeviceRegistry::health_check`].

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::PluginError;
use crate::vendor::VendorClient;

/// Device health as reported to the kubelet, mirrored verbatim from the
/// vendor peer. The broker never computes health itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceHealth {
    Healthy,
    Unhealthy,
}

impl DeviceHealth {
    /// Wire form used by the device-plugin API.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceHealth::Healthy => "Healthy",
            DeviceHealth::Unhealthy => "Unhealthy",
        }
    }
}

/// A point-in-time view of one tracked device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub id: String,
    pub health: DeviceHealth,
}

/// Registry of devices known to this node, keyed by the vendor-assigned
/// identity. Iteration order carries no meaning.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceHealth>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Populates the registry from the vendor peer's enumeration call.
    ///
    /// Every returned identity is upserted as Healthy; discovery does not
    /// carry a non-trivial health value yet, so health beyond "present"
    /// stays with [`DeviceRegistry::health_check`]. Returns the number of
    /// devices discovered. Zero devices is a successful refresh.
    pub async fn refresh(&self, vendor: &VendorClient) -> Result<usize, PluginError> {
        let ids = vendor.get_devices().await?;

        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        for id in &ids {
            tracing::info!(device_id = %id, "Discovered device");
            devices.insert(id.clone(), DeviceHealth::Healthy);
        }

        Ok(ids.len())
    }

    /// Returns the current set of records for streaming.
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, health)| DeviceRecord {
                id: id.clone(),
                health: *health,
            })
            .collect()
    }

    /// Recomputes the health of every tracked device and reports whether
    /// any record changed.
    ///
    /// The probe currently reports a fixed Healthy value; it is the
    /// extension point for vendor-driven health tracking.
    pub fn health_check(&self) -> bool {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        let mut changed = false;

        for (id, health) in devices.iter_mut() {
            let probed = Self::probe_health(id);
            if *health != probed {
                tracing::info!(
                    device_id = %id,
                    old = health.as_str(),
                    new = probed.as_str(),
                    "Device health changed"
                );
                *health = probed;
                changed = true;
            }
        }

        changed
    }

    /// Looks up the health of a single device.
    pub fn health_of(&self, id: &str) -> Option<DeviceHealth> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .copied()
    }

    /// Overrides the recorded health of one device. Seam for vendor-pushed
    /// health transitions; returns false if the device is not tracked.
    pub fn set_health(&self, id: &str, health: DeviceHealth) -> bool {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        match devices.get_mut(id) {
            Some(h) => {
                *h = health;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every record. Part of the graceful shutdown path.
    pub fn clear(&self) {
        self.devices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn probe_health(_id: &str) -> DeviceHealth {
        DeviceHealth::Healthy
    }
}

impl DeviceRegistry {
    /// Builds a registry pre-populated with healthy devices, bypassing
    /// the vendor call.
    pub fn with_devices<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new();
        {
            let mut devices = registry.devices.write().unwrap_or_else(|e| e.into_inner());
            for id in ids {
                devices.insert(id.into(), DeviceHealth::Healthy);
            }
        }
        registry
    }
}

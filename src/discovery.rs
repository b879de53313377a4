//! Radio scanning with a quiescence policy.
//!
//! Advertisements repeat on an interval and the fleet size is not known up
//! front, so a scan ends once no device has been heard for
//! `debounce_window`. Every advertisement restarts the window, which is
//! the same as each device running its own timer and the scan settling
//! when the most recently heard device's timer runs out. A scan that
//! hears nothing at all ends after one window with an empty result.

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::identity::{DeviceAddress, DeviceId};
use crate::shutdown::Shutdown;
use crate::transport::{Advertisement, RadioTransport};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{Instant, sleep_until};
use uuid::Uuid;

/// What the scanner learned about one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub address: DeviceAddress,
    pub local_name: Option<String>,
    pub services: Vec<Uuid>,
    pub rssi: Option<i16>,
    pub sightings: u32,
}

impl DiscoveredDevice {
    fn from_advertisement(advertisement: Advertisement) -> Self {
        Self {
            address: advertisement.address,
            local_name: advertisement.local_name,
            services: advertisement.services,
            rssi: advertisement.rssi,
            sightings: 1,
        }
    }

    fn merge(&mut self, advertisement: Advertisement) {
        if advertisement.local_name.is_some() {
            self.local_name = advertisement.local_name;
        }
        for service in advertisement.services {
            if !self.services.contains(&service) {
                self.services.push(service);
            }
        }
        if advertisement.rssi.is_some() {
            self.rssi = advertisement.rssi;
        }
        self.sightings += 1;
    }

    pub fn device_id(&self) -> DeviceId {
        self.address.to_device_id()
    }

    pub fn advertises(&self, service: &Uuid) -> bool {
        self.services.contains(service)
    }
}

/// Devices in the order they were first heard, keyed by address.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredDeviceSet {
    devices: Vec<DiscoveredDevice>,
    index: HashMap<DeviceAddress, usize>,
}

impl DiscoveredDeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an advertisement; returns true for a device not seen before.
    pub fn observe(&mut self, advertisement: Advertisement) -> bool {
        match self.index.get(&advertisement.address) {
            Some(&i) => {
                self.devices[i].merge(advertisement);
                false
            }
            None => {
                self.index.insert(advertisement.address, self.devices.len());
                self.devices
                    .push(DiscoveredDevice::from_advertisement(advertisement));
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, address: &DeviceAddress) -> Option<&DiscoveredDevice> {
        self.index.get(address).map(|&i| &self.devices[i])
    }

    pub fn contains(&self, address: &DeviceAddress) -> bool {
        self.index.contains_key(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiscoveredDevice> {
        self.devices.iter()
    }

    pub fn addresses(&self) -> Vec<DeviceAddress> {
        self.devices.iter().map(|d| d.address).collect()
    }

    /// Keeps only devices matching `keep`, preserving order.
    pub fn filtered(self, mut keep: impl FnMut(&DiscoveredDevice) -> bool) -> Self {
        let mut out = Self::new();
        for device in self.devices.into_iter().filter(|d| keep(d)) {
            out.index.insert(device.address, out.devices.len());
            out.devices.push(device);
        }
        out
    }
}

impl IntoIterator for DiscoveredDeviceSet {
    type Item = DiscoveredDevice;
    type IntoIter = std::vec::IntoIter<DiscoveredDevice>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.into_iter()
    }
}

/// A predicate applied to discovered devices.
pub type ScanFilter = Arc<dyn Fn(&DiscoveredDevice) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct DiscoveryEngine {
    transport: Arc<dyn RadioTransport>,
    config: Arc<GatewayConfig>,
    shutdown: Shutdown,
}

impl DiscoveryEngine {
    pub fn new(
        transport: Arc<dyn RadioTransport>,
        config: Arc<GatewayConfig>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            transport,
            config,
            shutdown,
        }
    }

    /// Scans until the device set settles and returns the sensors heard.
    pub async fn scan_all(&self) -> Result<DiscoveredDeviceSet, GatewayError> {
        let mut advertisements = self.transport.start_scan().await?;
        info!(target: "Gateway/Discovery", "Scanning for devices...");

        let started = Instant::now();
        let hard_stop = started + self.config.max_scan_duration;
        let mut quiet_deadline = started + self.config.debounce_window;
        let mut seen = DiscoveredDeviceSet::new();
        let mut scanner_open = true;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => break Err(GatewayError::Cancelled),
                _ = sleep_until(quiet_deadline) => {
                    debug!(target: "Gateway/Discovery", "No advertisements for {:?}, scan settled", self.config.debounce_window);
                    break Ok(());
                }
                _ = sleep_until(hard_stop) => {
                    warn!(target: "Gateway/Discovery", "Scan did not settle within {:?}, stopping", self.config.max_scan_duration);
                    break Ok(());
                }
                advertisement = advertisements.recv(), if scanner_open => match advertisement {
                    Some(advertisement) => {
                        quiet_deadline = Instant::now() + self.config.debounce_window;
                        let address = advertisement.address;
                        if seen.observe(advertisement) {
                            debug!(target: "Gateway/Discovery", "Discovered {address}");
                        }
                    }
                    None => scanner_open = false,
                },
            }
        };

        if let Err(e) = self.transport.stop_scan().await {
            warn!(target: "Gateway/Discovery", "Failed to stop scan: {e}");
        }
        outcome?;

        let total = seen.len();
        let devices = match self.config.required_service {
            Some(service) => seen.filtered(|d| d.advertises(&service)),
            None => seen,
        };
        info!(
            target: "Gateway/Discovery",
            "Scan finished: {} sensors among {total} devices",
            devices.len()
        );
        Ok(devices)
    }

    /// Like [`DiscoveryEngine::scan_all`] but keeps only devices passing every
    /// filter. `None` means there is nothing to scan for and returns an empty
    /// set without touching the radio.
    pub async fn scan_filtered(
        &self,
        filters: Option<&[ScanFilter]>,
    ) -> Result<DiscoveredDeviceSet, GatewayError> {
        let Some(filters) = filters else {
            return Ok(DiscoveredDeviceSet::new());
        };
        let devices = self.scan_all().await?;
        Ok(devices.filtered(|d| filters.iter().all(|f| f(d))))
    }
}

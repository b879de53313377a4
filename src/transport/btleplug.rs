//! [`RadioTransport`] backed by the host Bluetooth stack through `btleplug`.

use super::{Advertisement, Connection, RadioTransport, TransportError, poll_until};
use crate::codec::CharacteristicInfo;
use crate::identity::DeviceAddress;
use ::btleplug::api::bleuuid::uuid_from_u16;
use ::btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use ::btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

const SCAN_CHANNEL_SIZE: usize = 256;
const NOTIFY_CHANNEL_SIZE: usize = 256;
const USER_DESCRIPTION: u16 = 0x2901;
const PRESENTATION_FORMAT: u16 = 0x2904;
const LOOKUP_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

fn backend(e: ::btleplug::Error) -> TransportError {
    TransportError::Backend(e.into())
}

fn replace_task(slot: &Mutex<Option<JoinHandle<()>>>, task: Option<JoinHandle<()>>) {
    let previous = std::mem::replace(&mut *slot.lock().unwrap_or_else(|e| e.into_inner()), task);
    if let Some(previous) = previous {
        previous.abort();
    }
}

async fn cached_peripheral(
    adapter: &Adapter,
    address: DeviceAddress,
) -> Result<Option<Peripheral>, TransportError> {
    Ok(adapter
        .peripherals()
        .await
        .map_err(backend)?
        .into_iter()
        .find(|p| p.address().into_inner() == address.octets()))
}

pub struct BtleplugRadio {
    adapter: Adapter,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    lookup_timeout: Duration,
}

impl BtleplugRadio {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            scan_task: Mutex::new(None),
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    /// How long `connect` scans for an address the adapter has not seen yet.
    pub fn with_lookup_timeout(mut self, lookup_timeout: Duration) -> Self {
        self.lookup_timeout = lookup_timeout;
        self
    }

    /// Uses the first adapter the host reports.
    pub async fn first_adapter() -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(backend)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(backend)?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;
        Ok(Self::new(adapter))
    }

    /// The adapter only knows peripherals it has heard advertise. An
    /// address given without a prior scan is looked up by scanning briefly.
    async fn find_peripheral(&self, address: DeviceAddress) -> Result<Peripheral, TransportError> {
        if let Some(peripheral) = cached_peripheral(&self.adapter, address).await? {
            return Ok(peripheral);
        }

        debug!(target: "Gateway/Btleplug", "{address} not cached, scanning for up to {:?}", self.lookup_timeout);
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(backend)?;
        let adapter = &self.adapter;
        let found = poll_until(self.lookup_timeout, LOOKUP_INTERVAL, move || {
            cached_peripheral(adapter, address)
        })
        .await;
        if let Err(e) = self.adapter.stop_scan().await {
            warn!(target: "Gateway/Btleplug", "Failed to stop lookup scan: {e}");
        }

        found?.ok_or_else(|| {
            TransportError::ConnectFailed(
                address,
                format!("not seen by the adapter within {:?}", self.lookup_timeout),
            )
        })
    }
}

async fn advertisement(adapter: &Adapter, id: &PeripheralId) -> Option<Advertisement> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    Some(Advertisement {
        address: DeviceAddress::new(properties.address.into_inner()),
        local_name: properties.local_name,
        services: properties.services,
        rssi: properties.rssi,
    })
}

#[async_trait]
impl RadioTransport for BtleplugRadio {
    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>, TransportError> {
        let mut events = self.adapter.events().await.map_err(backend)?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(backend)?;

        let (tx, rx) = mpsc::channel(SCAN_CHANNEL_SIZE);
        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                if let Some(advertisement) = advertisement(&adapter, &id).await
                    && tx.send(advertisement).await.is_err()
                {
                    break;
                }
            }
        });
        replace_task(&self.scan_task, Some(task));
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        replace_task(&self.scan_task, None);
        self.adapter.stop_scan().await.map_err(backend)
    }

    async fn connect(&self, address: DeviceAddress) -> Result<Arc<dyn Connection>, TransportError> {
        let peripheral = self.find_peripheral(address).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| TransportError::ConnectFailed(address, e.to_string()))?;
        if let Err(e) = peripheral.discover_services().await {
            if let Err(e) = peripheral.disconnect().await {
                warn!(target: "Gateway/Btleplug", "Failed to disconnect from {address}: {e}");
            }
            return Err(backend(e));
        }
        Ok(Arc::new(BtleplugConnection {
            address,
            peripheral,
            notify_task: Mutex::new(None),
        }))
    }
}

struct BtleplugConnection {
    address: DeviceAddress,
    peripheral: Peripheral,
    notify_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugConnection {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::UnknownAttribute(uuid))
    }

    async fn describe(&self, characteristic: &Characteristic) -> CharacteristicInfo {
        let mut info = CharacteristicInfo {
            uuid: characteristic.uuid,
            description: characteristic.uuid.to_string(),
            presentation_format: 0,
        };
        for descriptor in &characteristic.descriptors {
            let value = match self.peripheral.read_descriptor(descriptor).await {
                Ok(value) => value,
                Err(e) => {
                    debug!(target: "Gateway/Btleplug", "Descriptor {} unreadable: {e}", descriptor.uuid);
                    continue;
                }
            };
            if descriptor.uuid == uuid_from_u16(USER_DESCRIPTION) {
                info.description = String::from_utf8_lossy(&value).into_owned();
            } else if descriptor.uuid == uuid_from_u16(PRESENTATION_FORMAT)
                && let Some(&format) = value.first()
            {
                info.presentation_format = format;
            }
        }
        info
    }
}

#[async_trait]
impl Connection for BtleplugConnection {
    fn address(&self) -> DeviceAddress {
        self.address
    }

    async fn read_attribute(&self, attribute: Uuid) -> Result<Bytes, TransportError> {
        let characteristic = self.characteristic(attribute)?;
        let value = self.peripheral.read(&characteristic).await.map_err(backend)?;
        Ok(Bytes::from(value))
    }

    async fn write_attribute(&self, attribute: Uuid, value: &[u8]) -> Result<(), TransportError> {
        let characteristic = self.characteristic(attribute)?;
        self.peripheral
            .write(&characteristic, value, WriteType::WithResponse)
            .await
            .map_err(backend)
    }

    async fn subscribe(&self, attribute: Uuid) -> Result<mpsc::Receiver<Bytes>, TransportError> {
        let characteristic = self.characteristic(attribute)?;
        let mut notifications = self.peripheral.notifications().await.map_err(backend)?;
        self.peripheral
            .subscribe(&characteristic)
            .await
            .map_err(backend)?;

        let (tx, rx) = mpsc::channel(NOTIFY_CHANNEL_SIZE);
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != attribute {
                    continue;
                }
                if tx.send(Bytes::from(notification.value)).await.is_err() {
                    break;
                }
            }
        });
        replace_task(&self.notify_task, Some(task));
        Ok(rx)
    }

    async fn unsubscribe(&self, attribute: Uuid) -> Result<(), TransportError> {
        let characteristic = self.characteristic(attribute)?;
        replace_task(&self.notify_task, None);
        self.peripheral
            .unsubscribe(&characteristic)
            .await
            .map_err(backend)
    }

    async fn characteristics(
        &self,
        service: Uuid,
    ) -> Result<Vec<CharacteristicInfo>, TransportError> {
        let service = self
            .peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .ok_or(TransportError::UnknownService(service))?;
        let mut infos = Vec::with_capacity(service.characteristics.len());
        for characteristic in &service.characteristics {
            infos.push(self.describe(characteristic).await);
        }
        Ok(infos)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        replace_task(&self.notify_task, None);
        self.peripheral.disconnect().await.map_err(backend)
    }
}

//! An in-memory radio with scripted devices.
//!
//! Advertisements are replayed on a schedule relative to scan start,
//! connection attempts can be made to fail, and writes to chosen
//! attributes make the device answer with notification chunks, which is
//! how the real firmware dumps its logs.

use super::{Advertisement, Connection, RadioTransport, TransportError};
use crate::codec::CharacteristicInfo;
use crate::identity::DeviceAddress;
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

const NOTIFY_CHANNEL_SIZE: usize = 256;
const REPLY_CHUNK_DELAY: Duration = Duration::from_millis(20);

/// Everything observable that happened on the simulated radio, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    ScanStarted,
    ScanStopped,
    ConnectAttempt(DeviceAddress),
    Connected(DeviceAddress),
    Subscribed(DeviceAddress, Uuid),
    Unsubscribed(DeviceAddress, Uuid),
    Write(DeviceAddress, Uuid, Vec<u8>),
    Disconnected(DeviceAddress),
    /// The peer went away without the central disconnecting.
    LinkLost(DeviceAddress),
}

/// Script for one peripheral.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    advertisement: Advertisement,
    connect_failures: Option<u32>,
    connect_delay: Duration,
    attributes: HashMap<Uuid, Bytes>,
    characteristics: HashMap<Uuid, Vec<CharacteristicInfo>>,
    replies: Vec<ReplyRule>,
}

#[derive(Debug, Clone)]
struct ReplyRule {
    attribute: Uuid,
    value: Option<Vec<u8>>,
    chunks: Vec<Bytes>,
}

impl ReplyRule {
    fn matches(&self, attribute: Uuid, value: &[u8]) -> bool {
        self.attribute == attribute && self.value.as_deref().is_none_or(|v| v == value)
    }
}

impl SimulatedDevice {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            advertisement: Advertisement::new(address),
            connect_failures: Some(0),
            connect_delay: Duration::ZERO,
            attributes: HashMap::new(),
            characteristics: HashMap::new(),
            replies: Vec::new(),
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.advertisement.address
    }

    pub fn with_advertisement(mut self, advertisement: Advertisement) -> Self {
        self.advertisement = advertisement;
        self
    }

    /// The first `n` connection attempts fail.
    pub fn failing_connects(mut self, n: u32) -> Self {
        self.connect_failures = Some(n);
        self
    }

    pub fn never_connects(mut self) -> Self {
        self.connect_failures = None;
        self
    }

    /// Every connection attempt takes `delay` before it is answered.
    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_attribute(mut self, attribute: Uuid, value: impl Into<Bytes>) -> Self {
        self.attributes.insert(attribute, value.into());
        self
    }

    /// Adds a described characteristic to `service` along with its value.
    pub fn with_characteristic(
        mut self,
        service: Uuid,
        info: CharacteristicInfo,
        value: impl Into<Bytes>,
    ) -> Self {
        self.attributes.insert(info.uuid, value.into());
        self.characteristics.entry(service).or_default().push(info);
        self
    }

    /// Every write to `attribute` is answered with `chunks` on the active
    /// notification subscription.
    pub fn replying_to_write<I, C>(mut self, attribute: Uuid, chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Bytes>,
    {
        self.replies.push(ReplyRule {
            attribute,
            value: None,
            chunks: chunks.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Like [`SimulatedDevice::replying_to_write`] but only for writes of
    /// exactly `value`.
    pub fn replying_to_value<I, C>(mut self, attribute: Uuid, value: &[u8], chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Bytes>,
    {
        self.replies.push(ReplyRule {
            attribute,
            value: Some(value.to_vec()),
            chunks: chunks.into_iter().map(Into::into).collect(),
        });
        self
    }
}

struct DeviceState {
    script: SimulatedDevice,
    failures_left: Option<u32>,
    connected: bool,
    subscription: Option<(Uuid, mpsc::Sender<Bytes>)>,
}

#[derive(Default)]
struct RadioState {
    devices: HashMap<DeviceAddress, DeviceState>,
    schedule: Vec<(Duration, Advertisement)>,
    scan_task: Option<JoinHandle<()>>,
    events: Vec<RadioEvent>,
    attempts: HashMap<DeviceAddress, u32>,
}

/// In-memory [`RadioTransport`].
#[derive(Clone, Default)]
pub struct SimulatedRadio {
    state: Arc<Mutex<RadioState>>,
}

impl SimulatedRadio {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RadioState> {
        lock_state(&self.state)
    }

    pub fn add_device(&self, device: SimulatedDevice) {
        let failures_left = device.connect_failures;
        self.lock().devices.insert(
            device.address(),
            DeviceState {
                script: device,
                failures_left,
                connected: false,
                subscription: None,
            },
        );
    }

    /// Schedules one advertisement `offset` after scan start.
    pub fn advertise_at(&self, offset: Duration, address: DeviceAddress) {
        let mut state = self.lock();
        let advertisement = state
            .devices
            .get(&address)
            .map(|d| d.script.advertisement.clone())
            .unwrap_or_else(|| Advertisement::new(address));
        state.schedule.push((offset, advertisement));
    }

    pub fn advertise_every(
        &self,
        address: DeviceAddress,
        first: Duration,
        period: Duration,
        count: u32,
    ) {
        for i in 0..count {
            self.advertise_at(first + period * i, address);
        }
    }

    pub fn connect_attempts(&self, address: DeviceAddress) -> u32 {
        self.lock().attempts.get(&address).copied().unwrap_or(0)
    }

    pub fn events(&self) -> Vec<RadioEvent> {
        self.lock().events.clone()
    }

    pub fn writes(&self, address: DeviceAddress) -> Vec<(Uuid, Vec<u8>)> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                RadioEvent::Write(a, attribute, value) if *a == address => {
                    Some((*attribute, value.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Drops the link to `address`: its notification stream ends and the
    /// connection stops answering.
    pub fn lose_link(&self, address: DeviceAddress) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(device) = state.devices.get_mut(&address) {
            device.connected = false;
            device.subscription = None;
            state.events.push(RadioEvent::LinkLost(address));
        }
    }

    /// Pushes a notification chunk to the device's active subscription.
    /// Returns false when nothing is subscribed.
    pub async fn notify(&self, address: DeviceAddress, chunk: impl Into<Bytes>) -> bool {
        let sender = self
            .lock()
            .devices
            .get(&address)
            .and_then(|d| d.subscription.as_ref().map(|(_, tx)| tx.clone()));
        match sender {
            Some(tx) => tx.send(chunk.into()).await.is_ok(),
            None => false,
        }
    }
}

fn lock_state(state: &Mutex<RadioState>) -> MutexGuard<'_, RadioState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl RadioTransport for SimulatedRadio {
    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>, TransportError> {
        let (tx, rx) = mpsc::channel(NOTIFY_CHANNEL_SIZE);
        let mut state = self.lock();
        let mut schedule = state.schedule.clone();
        schedule.sort_by_key(|(offset, _)| *offset);

        let started = Instant::now();
        let task = tokio::spawn(async move {
            for (offset, advertisement) in schedule {
                tokio::time::sleep_until(started + offset).await;
                if tx.send(advertisement).await.is_err() {
                    break;
                }
            }
            // Keep the channel open like a real scanner that has gone quiet.
            std::future::pending::<()>().await;
        });

        if let Some(previous) = state.scan_task.replace(task) {
            previous.abort();
        }
        state.events.push(RadioEvent::ScanStarted);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if let Some(task) = state.scan_task.take() {
            task.abort();
        }
        state.events.push(RadioEvent::ScanStopped);
        Ok(())
    }

    async fn connect(&self, address: DeviceAddress) -> Result<Arc<dyn Connection>, TransportError> {
        let delay = {
            let mut state = self.lock();
            state.events.push(RadioEvent::ConnectAttempt(address));
            *state.attempts.entry(address).or_default() += 1;
            state
                .devices
                .get(&address)
                .map(|d| d.script.connect_delay)
                .unwrap_or_default()
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();

        let device = state
            .devices
            .get_mut(&address)
            .ok_or_else(|| TransportError::ConnectFailed(address, "device not in range".into()))?;

        match device.failures_left.as_mut() {
            None => {
                return Err(TransportError::ConnectFailed(address, "no response".into()));
            }
            Some(left) if *left > 0 => {
                *left -= 1;
                return Err(TransportError::ConnectFailed(address, "no response".into()));
            }
            Some(_) => {}
        }

        device.connected = true;
        state.events.push(RadioEvent::Connected(address));
        debug!(target: "Gateway/SimulatedRadio", "Connected to {address}");

        Ok(Arc::new(SimulatedConnection {
            address,
            state: self.state.clone(),
        }))
    }
}

struct SimulatedConnection {
    address: DeviceAddress,
    state: Arc<Mutex<RadioState>>,
}

impl SimulatedConnection {
    fn with_device<T>(
        &self,
        f: impl FnOnce(&mut DeviceState, &mut Vec<RadioEvent>) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let device = state
            .devices
            .get_mut(&self.address)
            .filter(|d| d.connected)
            .ok_or(TransportError::NotConnected(self.address))?;
        f(device, &mut state.events)
    }
}

#[async_trait]
impl Connection for SimulatedConnection {
    fn address(&self) -> DeviceAddress {
        self.address
    }

    async fn read_attribute(&self, attribute: Uuid) -> Result<Bytes, TransportError> {
        self.with_device(|device, _| {
            device
                .script
                .attributes
                .get(&attribute)
                .cloned()
                .ok_or(TransportError::UnknownAttribute(attribute))
        })
    }

    async fn write_attribute(&self, attribute: Uuid, value: &[u8]) -> Result<(), TransportError> {
        let address = self.address;
        let reply = self.with_device(|device, events| {
            events.push(RadioEvent::Write(address, attribute, value.to_vec()));
            device
                .script
                .attributes
                .insert(attribute, Bytes::copy_from_slice(value));
            let chunks = device
                .script
                .replies
                .iter()
                .find(|rule| rule.matches(attribute, value))
                .map(|rule| rule.chunks.clone());
            let sender = device.subscription.as_ref().map(|(_, tx)| tx.clone());
            Ok(chunks.zip(sender))
        })?;

        if let Some((chunks, tx)) = reply {
            tokio::spawn(async move {
                for chunk in chunks {
                    tokio::time::sleep(REPLY_CHUNK_DELAY).await;
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
            });
        }
        Ok(())
    }

    async fn subscribe(&self, attribute: Uuid) -> Result<mpsc::Receiver<Bytes>, TransportError> {
        let address = self.address;
        self.with_device(|device, events| {
            let (tx, rx) = mpsc::channel(NOTIFY_CHANNEL_SIZE);
            device.subscription = Some((attribute, tx));
            events.push(RadioEvent::Subscribed(address, attribute));
            Ok(rx)
        })
    }

    async fn unsubscribe(&self, attribute: Uuid) -> Result<(), TransportError> {
        let address = self.address;
        self.with_device(|device, events| {
            if device
                .subscription
                .as_ref()
                .is_some_and(|(subscribed, _)| *subscribed == attribute)
            {
                device.subscription = None;
            }
            events.push(RadioEvent::Unsubscribed(address, attribute));
            Ok(())
        })
    }

    async fn characteristics(
        &self,
        service: Uuid,
    ) -> Result<Vec<CharacteristicInfo>, TransportError> {
        self.with_device(|device, _| {
            device
                .script
                .characteristics
                .get(&service)
                .cloned()
                .ok_or(TransportError::UnknownService(service))
        })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let address = self.address;
        self.with_device(|device, events| {
            device.connected = false;
            device.subscription = None;
            events.push(RadioEvent::Disconnected(address));
            Ok(())
        })
    }
}

//! The radio seam: everything the gateway needs from a BLE central.
//!
//! Scan results and notifications are delivered over channels; the
//! implementation owns whatever tasks feed them.

#[cfg(feature = "btleplug")]
pub mod btleplug;
pub mod simulated;

use crate::codec::CharacteristicInfo;
use crate::identity::DeviceAddress;
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection to {0} failed: {1}")]
    ConnectFailed(DeviceAddress, String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("device {0} is not connected")]
    NotConnected(DeviceAddress),
    #[error("attribute {0} not found")]
    UnknownAttribute(Uuid),
    #[error("service {0} not found")]
    UnknownService(Uuid),
    #[error("no radio adapter available")]
    NoAdapter,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// One advertisement as seen by the scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub address: DeviceAddress,
    pub local_name: Option<String>,
    pub services: Vec<Uuid>,
    pub rssi: Option<i16>,
}

impl Advertisement {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            local_name: None,
            services: Vec::new(),
            rssi: None,
        }
    }

    pub fn with_service(mut self, service: Uuid) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }
}

/// A BLE central able to scan for and connect to peripherals.
#[async_trait]
pub trait RadioTransport: Send + Sync {
    /// Starts scanning; advertisements arrive on the returned channel until
    /// [`RadioTransport::stop_scan`] is called.
    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>, TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// A single connection attempt.
    async fn connect(&self, address: DeviceAddress) -> Result<Arc<dyn Connection>, TransportError>;
}

/// An established link to one peripheral.
#[async_trait]
pub trait Connection: Send + Sync {
    fn address(&self) -> DeviceAddress;

    async fn read_attribute(&self, attribute: Uuid) -> Result<Bytes, TransportError>;

    async fn write_attribute(&self, attribute: Uuid, value: &[u8]) -> Result<(), TransportError>;

    /// Enables notifications; each notification payload is one chunk.
    async fn subscribe(&self, attribute: Uuid) -> Result<mpsc::Receiver<Bytes>, TransportError>;

    async fn unsubscribe(&self, attribute: Uuid) -> Result<(), TransportError>;

    /// Characteristics of `service` with their user description and
    /// presentation format descriptors.
    async fn characteristics(&self, service: Uuid)
    -> Result<Vec<CharacteristicInfo>, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Calls `lookup` every `interval` until it yields a value or `limit` has
/// passed. Returns `None` on expiry; lookup errors end the wait.
pub async fn poll_until<T, F, Fut>(
    limit: Duration,
    interval: Duration,
    mut lookup: F,
) -> Result<Option<T>, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, TransportError>>,
{
    let deadline = Instant::now() + limit;
    loop {
        if let Some(found) = lookup().await? {
            return Ok(Some(found));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        sleep_until(deadline.min(now + interval)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_returns_once_found() {
        let calls = &AtomicU32::new(0);
        let started = Instant::now();
        let found = poll_until(Duration::from_secs(5), Duration::from_millis(250), move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok((n == 3).then_some(n))
        })
        .await
        .unwrap();

        assert_eq!(found, Some(3));
        assert_eq!(started.elapsed(), Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_gives_up_at_limit() {
        let started = Instant::now();
        let found: Option<()> =
            poll_until(Duration::from_secs(2), Duration::from_millis(300), || async { Ok(None) })
                .await
                .unwrap();

        assert_eq!(found, None);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_stops_on_error() {
        let result: Result<Option<()>, _> =
            poll_until(Duration::from_secs(2), Duration::from_millis(300), || async {
                Err(TransportError::NoAdapter)
            })
            .await;
        assert!(matches!(result, Err(TransportError::NoAdapter)));
    }
}

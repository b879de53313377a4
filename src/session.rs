//! Connection establishment and scoped device sessions.
//!
//! A session subscribes to the device's UART TX characteristic, feeds
//! every notification chunk through a [`StreamReassembler`] and hands
//! each complete message to a [`MessageHandler`], strictly in order. The
//! caller's body runs interleaved with that message pump on the same
//! task, so handlers and the body never execute at the same time.
//!
//! On the way out the session waits for a half-received message to be
//! completed (bounded by `drain_timeout`), unsubscribes, and disconnects.

use crate::config::{AttributeTable, GatewayConfig};
use crate::confirmation::ConfirmationTracker;
use crate::error::GatewayError;
use crate::framing::{RawMessage, StreamReassembler};
use crate::identity::{DeviceAddress, DeviceId};
use crate::shutdown::Shutdown;
use crate::transport::{Connection, RadioTransport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

/// Receives every complete message of a session, one at a time.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, session: &Session, message: RawMessage)
    -> anyhow::Result<()>;
}

/// A live connection to one device. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    device_id: DeviceId,
    connection: Arc<dyn Connection>,
    confirmations: ConfirmationTracker,
    config: Arc<GatewayConfig>,
}

impl Session {
    fn new(connection: Arc<dyn Connection>, config: Arc<GatewayConfig>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                device_id: connection.address().to_device_id(),
                connection,
                confirmations: ConfirmationTracker::new(),
                config,
            }),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    pub fn address(&self) -> DeviceAddress {
        self.inner.connection.address()
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.inner.connection
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn attributes(&self) -> &AttributeTable {
        &self.inner.config.attributes
    }

    pub fn confirmations(&self) -> &ConfirmationTracker {
        &self.inner.confirmations
    }

    pub async fn read(&self, attribute: Uuid) -> Result<Bytes, TransportError> {
        self.inner.connection.read_attribute(attribute).await
    }

    pub async fn write(&self, attribute: Uuid, value: &[u8]) -> Result<(), TransportError> {
        self.inner.connection.write_attribute(attribute, value).await
    }

    /// Writes a value the device answers with one stream message.
    pub async fn write_expecting_reply(
        &self,
        attribute: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        // Counted before the write so a fast reply cannot be missed.
        self.inner.confirmations.expect_one();
        if let Err(e) = self.write(attribute, value).await {
            self.inner.confirmations.on_ack_observed();
            return Err(e);
        }
        Ok(())
    }

    /// Reads every characteristic of the sensor service as
    /// `"<description>: <value>"` lines.
    pub async fn describe_characteristics(&self) -> Result<Vec<String>, TransportError> {
        let infos = self
            .inner
            .connection
            .characteristics(self.attributes().service)
            .await?;
        let mut lines = Vec::with_capacity(infos.len());
        for info in infos {
            let raw = self.read(info.uuid).await?;
            lines.push(info.describe(&raw));
        }
        Ok(lines)
    }
}

struct MessagePump {
    session: Session,
    handler: Arc<dyn MessageHandler>,
    reassembler: StreamReassembler,
    handler_error: Option<anyhow::Error>,
}

impl MessagePump {
    fn new(session: Session, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            session,
            handler,
            reassembler: StreamReassembler::new(),
            handler_error: None,
        }
    }

    async fn feed(&mut self, chunk: &[u8]) {
        for message in self.reassembler.append(chunk) {
            debug!(
                target: "Gateway/Session",
                "<-- Message from {}: {} bytes",
                self.session.device_id(),
                message.len()
            );
            if let Err(e) = self.handler.handle_message(&self.session, message).await {
                warn!(
                    target: "Gateway/Session",
                    "Message handler failed for {}: {e:#}",
                    self.session.device_id()
                );
                self.handler_error.get_or_insert(e);
            }
            self.session.confirmations().on_ack_observed();
        }
    }

    fn has_pending_partial(&self) -> bool {
        self.reassembler.has_pending_partial()
    }
}

/// Opens sessions one connection attempt at a time.
#[derive(Clone)]
pub struct SessionManager {
    transport: Arc<dyn RadioTransport>,
    config: Arc<GatewayConfig>,
    shutdown: Shutdown,
    active: Arc<AtomicUsize>,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn RadioTransport>,
        config: Arc<GatewayConfig>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            transport,
            config,
            shutdown,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of sessions currently open.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Tries up to `max_connect_attempts` sequential connection attempts,
    /// each bounded by `connect_timeout`.
    pub async fn connect(&self, address: DeviceAddress) -> Result<Arc<dyn Connection>, GatewayError> {
        let attempts = self.config.max_connect_attempts.max(1);
        let mut attempt = 1;
        loop {
            if self.shutdown.is_triggered() {
                return Err(GatewayError::Cancelled);
            }
            let error = match timeout(self.config.connect_timeout, self.transport.connect(address)).await {
                Ok(Ok(connection)) => {
                    info!(
                        target: "Gateway/Session",
                        "Connected to {address} (attempt {attempt}/{attempts})"
                    );
                    return Ok(connection);
                }
                Ok(Err(e)) => e,
                Err(_) => TransportError::Timeout(self.config.connect_timeout),
            };
            debug!(
                target: "Gateway/Session",
                "Connection attempt {attempt}/{attempts} to {address} failed: {error}"
            );

            if attempt == attempts {
                warn!(target: "Gateway/Session", "Giving up on {address} after {attempts} attempts");
                return Err(GatewayError::ConnectionFailure {
                    address,
                    attempts,
                    source: error,
                });
            }
            attempt += 1;
        }
    }

    /// Connects to `address`, runs `body` with the live session and always
    /// unsubscribes and disconnects afterwards.
    pub async fn with_session<F, Fut, T>(
        &self,
        address: DeviceAddress,
        handler: Arc<dyn MessageHandler>,
        body: F,
    ) -> Result<T, GatewayError>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let connection = self.connect(address).await?;

        self.active.fetch_add(1, Ordering::SeqCst);
        let active = self.active.clone();
        let _active_guard = scopeguard::guard((), move |_| {
            active.fetch_sub(1, Ordering::SeqCst);
        });

        let session = Session::new(connection.clone(), self.config.clone());
        let outcome = self.run_subscribed(&session, handler, body).await;

        match connection.disconnect().await {
            Ok(()) => debug!(target: "Gateway/Session", "Disconnected from {address}"),
            Err(e) => warn!(target: "Gateway/Session", "Failed to disconnect from {address}: {e}"),
        }
        outcome
    }

    async fn run_subscribed<F, Fut, T>(
        &self,
        session: &Session,
        handler: Arc<dyn MessageHandler>,
        body: F,
    ) -> Result<T, GatewayError>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let uart_tx = self.config.attributes.uart_tx;
        let mut notifications = session.connection().subscribe(uart_tx).await?;
        let mut pump = MessagePump::new(session.clone(), handler);

        let mut outcome = self
            .drive(&mut pump, &mut notifications, body(session.clone()))
            .await;

        // A failed body skips the drain so a silent peer cannot hang shutdown.
        if outcome.is_ok() {
            if let Err(e) = self.drain(&mut pump, &mut notifications).await {
                outcome = Err(e);
            }
        }

        if let Err(e) = session.connection().unsubscribe(uart_tx).await {
            warn!(
                target: "Gateway/Session",
                "Failed to unsubscribe from {}: {e}",
                session.device_id()
            );
        }

        if let (Ok(_), Some(source)) = (&outcome, pump.handler_error.take()) {
            return Err(GatewayError::Handler {
                device: session.device_id().clone(),
                source,
            });
        }
        outcome
    }

    async fn drive<Fut, T>(
        &self,
        pump: &mut MessagePump,
        notifications: &mut mpsc::Receiver<Bytes>,
        body: Fut,
    ) -> Result<T, GatewayError>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        tokio::pin!(body);
        let mut stream_open = true;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => return Err(GatewayError::Cancelled),
                result = &mut body => {
                    return result.map_err(|source| GatewayError::Operator {
                        device: pump.session.device_id().clone(),
                        source,
                    });
                }
                chunk = notifications.recv(), if stream_open => match chunk {
                    Some(chunk) => pump.feed(&chunk).await,
                    None => {
                        debug!(
                            target: "Gateway/Session",
                            "Notification stream of {} closed",
                            pump.session.device_id()
                        );
                        stream_open = false;
                    }
                },
            }
        }
    }

    async fn drain(
        &self,
        pump: &mut MessagePump,
        notifications: &mut mpsc::Receiver<Bytes>,
    ) -> Result<(), GatewayError> {
        // Chunks that arrived while the body was finishing are already ours.
        while let Ok(chunk) = notifications.try_recv() {
            pump.feed(&chunk).await;
        }
        if !pump.has_pending_partial() {
            return Ok(());
        }
        let device = pump.session.device_id().clone();
        info!(
            target: "Gateway/Session",
            "Waiting for data dump from {device} ({} bytes buffered)",
            pump.reassembler.pending_len()
        );

        let drain_timeout = self.config.drain_timeout;
        let waited = tokio::select! {
            _ = self.shutdown.wait() => None,
            result = timeout(drain_timeout, async {
                while pump.has_pending_partial() {
                    match notifications.recv().await {
                        Some(chunk) => pump.feed(&chunk).await,
                        None => return false,
                    }
                }
                true
            }) => Some(result),
        };

        let pending = pump.reassembler.pending_len();
        match waited {
            None => Err(GatewayError::Cancelled),
            Some(Ok(true)) => Ok(()),
            Some(Ok(false)) => Err(GatewayError::DrainClosed { device, pending }),
            Some(Err(_)) => Err(GatewayError::DrainTimeout {
                device,
                pending,
                waited: drain_timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::simulated::{RadioEvent, SimulatedDevice, SimulatedRadio};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect {
        messages: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl MessageHandler for Collect {
        async fn handle_message(&self, _: &Session, message: RawMessage) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.messages.lock().unwrap().push(message.to_vec());
            Ok(())
        }
    }

    fn address(last: u8) -> DeviceAddress {
        DeviceAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last])
    }

    fn manager(radio: &SimulatedRadio, config: GatewayConfig) -> SessionManager {
        SessionManager::new(Arc::new(radio.clone()), Arc::new(config), Shutdown::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_succeeds_after_transient_failures() {
        let radio = SimulatedRadio::new();
        radio.add_device(SimulatedDevice::new(address(1)).failing_connects(3));
        let sessions = manager(&radio, GatewayConfig::default());

        sessions.connect(address(1)).await.unwrap();
        assert_eq!(radio.connect_attempts(address(1)), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_max_attempts() {
        let radio = SimulatedRadio::new();
        radio.add_device(SimulatedDevice::new(address(2)).never_connects());
        let sessions = manager(&radio, GatewayConfig::default());

        let err = sessions.connect(address(2)).await.err().unwrap();
        assert!(matches!(
            err,
            GatewayError::ConnectionFailure { attempts: 10, .. }
        ));
        assert_eq!(radio.connect_attempts(address(2)), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_attempts_are_bounded_by_timeout() {
        let radio = SimulatedRadio::new();
        radio.add_device(SimulatedDevice::new(address(8)).connect_delay(Duration::from_secs(30)));
        let sessions = manager(&radio, GatewayConfig::default());

        let started = tokio::time::Instant::now();
        let err = sessions.connect(address(8)).await.err().unwrap();

        match err {
            GatewayError::ConnectionFailure {
                attempts: 10,
                source: TransportError::Timeout(waited),
                ..
            } => assert_eq!(waited, Duration::from_secs(10)),
            other => panic!("unexpected {other}"),
        }
        assert_eq!(started.elapsed(), Duration::from_secs(100));
        assert_eq!(radio.connect_attempts(address(8)), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_are_delivered_in_order_and_session_closes_cleanly() {
        let radio = SimulatedRadio::new();
        let config = GatewayConfig::default();
        let is_logging = config.attributes.is_logging;
        radio.add_device(
            SimulatedDevice::new(address(3))
                .replying_to_write(
                    is_logging,
                    [
                        b"a,1\n".as_slice(),
                        b"b,2\x08c".as_slice(),
                        b",3\x08".as_slice(),
                    ],
                ),
        );
        let sessions = manager(&radio, config);
        let collect = Arc::new(Collect::default());

        sessions
            .with_session(address(3), collect.clone(), |session| async move {
                session.write_expecting_reply(is_logging, &[0]).await?;
                session.confirmations().wait_until_settled().await;
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(
            *collect.messages.lock().unwrap(),
            vec![b"a,1\nb,2".to_vec(), b"c,3".to_vec()]
        );
        let events = radio.events();
        let tail: Vec<_> = events.iter().rev().take(2).cloned().collect();
        assert_eq!(
            tail,
            vec![
                RadioEvent::Disconnected(address(3)),
                RadioEvent::Unsubscribed(address(3), sessions.config.attributes.uart_tx),
            ]
        );
        assert_eq!(sessions.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_partial_message() {
        let radio = SimulatedRadio::new();
        radio.add_device(SimulatedDevice::new(address(4)));
        let sessions = manager(&radio, GatewayConfig::default());
        let collect = Arc::new(Collect::default());

        let feeder = radio.clone();
        sessions
            .with_session(address(4), collect.clone(), |_session| async move {
                assert!(feeder.notify(address(4), &b"half"[..]).await);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    feeder.notify(address(4), &b" done\x08"[..]).await;
                });
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(*collect.messages.lock().unwrap(), vec![b"half done".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_is_bounded_by_timeout() {
        let radio = SimulatedRadio::new();
        radio.add_device(SimulatedDevice::new(address(5)));
        let config = GatewayConfig {
            drain_timeout: Duration::from_secs(2),
            ..GatewayConfig::default()
        };
        let sessions = manager(&radio, config);

        let feeder = radio.clone();
        let err = sessions
            .with_session(address(5), Arc::new(Collect::default()), |_| async move {
                feeder.notify(address(5), &b"never finished"[..]).await;
                Ok(())
            })
            .await
            .err()
            .unwrap();

        assert!(matches!(err, GatewayError::DrainTimeout { pending: 14, .. }));
        assert!(radio.events().contains(&RadioEvent::Disconnected(address(5))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_link_with_partial_message_reports_drain_closed() {
        let radio = SimulatedRadio::new();
        radio.add_device(SimulatedDevice::new(address(9)));
        let sessions = manager(&radio, GatewayConfig::default());
        let collect = Arc::new(Collect::default());

        let feeder = radio.clone();
        let err = sessions
            .with_session(address(9), collect.clone(), |_| async move {
                feeder.notify(address(9), &b"t,o2\n1,2"[..]).await;
                feeder.lose_link(address(9));
                Ok(())
            })
            .await
            .err()
            .unwrap();

        assert!(matches!(err, GatewayError::DrainClosed { pending: 8, .. }), "{err}");
        assert!(collect.messages.lock().unwrap().is_empty());
        assert!(radio.events().contains(&RadioEvent::LinkLost(address(9))));
        assert_eq!(sessions.active_sessions(), 0);
    }

    struct FailingStore;

    #[async_trait]
    impl crate::store::RecordStore for FailingStore {
        async fn store_record(&self, _: &DeviceId, _: &[u8]) -> anyhow::Result<String> {
            anyhow::bail!("disk full")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_surfaces_after_clean_close() {
        let radio = SimulatedRadio::new();
        let config = GatewayConfig::default();
        let is_logging = config.attributes.is_logging;
        let uart_tx = config.attributes.uart_tx;
        radio.add_device(
            SimulatedDevice::new(address(10))
                .replying_to_write(is_logging, [b"a,1\x08b,2\x08".as_slice()]),
        );
        let sessions = manager(&radio, config);
        let uploader = Arc::new(crate::store::RecordUploader::new(Arc::new(FailingStore)));

        let err = sessions
            .with_session(address(10), uploader, |session| async move {
                session.write_expecting_reply(is_logging, &[0]).await?;
                session.confirmations().wait_until_settled().await;
                Ok(())
            })
            .await
            .err()
            .unwrap();

        match &err {
            GatewayError::Handler { device, source } => {
                assert_eq!(*device, address(10).to_device_id());
                assert!(source.to_string().contains("disk full"));
            }
            other => panic!("unexpected {other}"),
        }
        let events = radio.events();
        assert!(events.contains(&RadioEvent::Unsubscribed(address(10), uart_tx)));
        assert_eq!(events.last(), Some(&RadioEvent::Disconnected(address(10))));
        assert_eq!(sessions.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_body_still_disconnects() {
        let radio = SimulatedRadio::new();
        radio.add_device(SimulatedDevice::new(address(6)));
        let sessions = manager(&radio, GatewayConfig::default());

        let feeder = radio.clone();
        let err = sessions
            .with_session(address(6), Arc::new(Collect::default()), |_| async move {
                feeder.notify(address(6), &b"partial"[..]).await;
                Err::<(), _>(anyhow::anyhow!("operator blew up"))
            })
            .await
            .err()
            .unwrap();

        assert!(matches!(err, GatewayError::Operator { .. }));
        let events = radio.events();
        assert!(events.contains(&RadioEvent::Disconnected(address(6))));
        assert_eq!(sessions.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_a_running_session() {
        let radio = SimulatedRadio::new();
        radio.add_device(SimulatedDevice::new(address(7)));
        let shutdown = Shutdown::new();
        let sessions = SessionManager::new(
            Arc::new(radio.clone()),
            Arc::new(GatewayConfig::default()),
            shutdown.clone(),
        );

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            shutdown.trigger();
        });
        let err = sessions
            .with_session(address(7), Arc::new(Collect::default()), |_| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await
            .err()
            .unwrap();

        assert!(matches!(err, GatewayError::Cancelled));
        assert!(radio.events().contains(&RadioEvent::Disconnected(address(7))));
    }
}

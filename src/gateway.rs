use crate::config::GatewayConfig;
use crate::directive::{Directive, DirectiveRunner, FleetReport};
use crate::discovery::{DiscoveredDeviceSet, DiscoveryEngine};
use crate::error::GatewayError;
use crate::identity::DeviceAddress;
use crate::scheduler::{DeviceReport, TestOutcome, TestScheduler};
use crate::session::{MessageHandler, SessionManager};
use crate::shutdown::Shutdown;
use crate::store::{MemoryRecordStore, RecordStore, RecordUploader};
use crate::transport::RadioTransport;
use std::sync::Arc;
use std::time::Duration;

/// Owns the shared pieces of a gateway and exposes its fleet operations.
pub struct Gateway {
    config: Arc<GatewayConfig>,
    discovery: DiscoveryEngine,
    sessions: SessionManager,
    scheduler: TestScheduler,
    directives: DirectiveRunner,
    shutdown: Shutdown,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn discovery(&self) -> &DiscoveryEngine {
        &self.discovery
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Handle that cancels every running operation when triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub async fn scan(&self) -> Result<DiscoveredDeviceSet, GatewayError> {
        self.discovery.scan_all().await
    }

    pub async fn test_device(&self, address: DeviceAddress) -> Result<DeviceReport, GatewayError> {
        self.scheduler.test_device(address).await
    }

    pub async fn run_tests(
        &self,
        target_avg_test_duration: Duration,
        sample_size: usize,
    ) -> Result<Vec<TestOutcome>, GatewayError> {
        self.scheduler
            .run_tests(target_avg_test_duration, sample_size)
            .await
    }

    pub async fn run_directives(
        &self,
        directives: impl IntoIterator<Item = Directive>,
    ) -> Result<FleetReport, GatewayError> {
        self.directives.run(directives).await
    }
}

#[derive(Default)]
pub struct GatewayBuilder {
    config: Option<GatewayConfig>,
    transport: Option<Arc<dyn RadioTransport>>,
    store: Option<Arc<dyn RecordStore>>,
    shutdown: Option<Shutdown>,
}

impl GatewayBuilder {
    pub fn with_config(mut self, config: GatewayConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn RadioTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Where device records go. Defaults to an in-memory store.
    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Shares an existing shutdown handle, e.g. one wired to Ctrl-C.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn build(self) -> Result<Gateway, GatewayError> {
        let transport = self
            .transport
            .ok_or_else(|| GatewayError::Config("a radio transport is required".into()))?;
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let config = Arc::new(config);
        let shutdown = self.shutdown.unwrap_or_default();
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryRecordStore::new()));
        let handler: Arc<dyn MessageHandler> = Arc::new(RecordUploader::new(store));

        let discovery = DiscoveryEngine::new(transport.clone(), config.clone(), shutdown.clone());
        let sessions = SessionManager::new(transport, config.clone(), shutdown.clone());
        let scheduler = TestScheduler::new(
            discovery.clone(),
            sessions.clone(),
            handler.clone(),
            config.clone(),
            shutdown.clone(),
        );
        let directives = DirectiveRunner::new(
            discovery.clone(),
            sessions.clone(),
            handler,
            config.clone(),
            shutdown.clone(),
        );

        Ok(Gateway {
            config,
            discovery,
            sessions,
            scheduler,
            directives,
            shutdown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::simulated::SimulatedRadio;

    #[test]
    fn test_build_requires_a_transport() {
        let err = Gateway::builder().build().err().unwrap();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = GatewayConfig {
            max_connect_attempts: 0,
            ..GatewayConfig::default()
        };
        let result = Gateway::builder()
            .with_transport(Arc::new(SimulatedRadio::new()))
            .with_config(config)
            .build();
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_shutdown_is_shared() {
        let shutdown = Shutdown::new();
        let gateway = Gateway::builder()
            .with_transport(Arc::new(SimulatedRadio::new()))
            .with_shutdown(shutdown.clone())
            .build()
            .unwrap();
        gateway.shutdown();
        assert!(shutdown.is_triggered());
        assert!(gateway.shutdown_handle().is_triggered());
    }
}

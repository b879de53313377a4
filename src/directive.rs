//! Declarative fleet operations.
//!
//! Callers describe what to do as a list of [`Directive`]s: which devices to
//! look for, which addresses to include regardless, and which operators to
//! run on each connected device. Directives of the same kind are merged
//! before anything touches the radio.

use crate::config::GatewayConfig;
use crate::discovery::{DiscoveredDevice, DiscoveryEngine, ScanFilter};
use crate::error::GatewayError;
use crate::identity::{DeviceAddress, DeviceId, id_to_address};
use crate::operators::Operator;
use crate::session::{MessageHandler, SessionManager};
use crate::shutdown::Shutdown;
use anyhow::Context;
use log::{debug, error, info};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub enum Directive {
    /// Only discovered devices passing every filter are processed.
    ScanFilter(ScanFilter),
    /// Devices processed whether or not they were discovered.
    Addresses(Vec<DeviceAddress>),
    /// Run on every processed device, in the order given.
    ConnectedOperator(Operator),
}

impl Directive {
    pub fn scan_filter(f: impl Fn(&DiscoveredDevice) -> bool + Send + Sync + 'static) -> Self {
        Directive::ScanFilter(Arc::new(f))
    }

    pub fn addresses(addresses: impl IntoIterator<Item = DeviceAddress>) -> Self {
        Directive::Addresses(addresses.into_iter().collect())
    }

    /// Parses device ids into an address directive.
    pub fn device_ids<I, S>(ids: I) -> Result<Self, GatewayError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ids.into_iter()
            .map(|id| id_to_address(id.as_ref()))
            .collect::<Result<Vec<_>, _>>()
            .map(Directive::Addresses)
    }

    /// Keeps devices whose advertised name starts with `prefix`.
    pub fn name_prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self::scan_filter(move |device| {
            device
                .local_name
                .as_deref()
                .is_some_and(|name| name.starts_with(&prefix))
        })
    }

    pub fn operator(operator: Operator) -> Self {
        Directive::ConnectedOperator(operator)
    }
}

impl From<Operator> for Directive {
    fn from(operator: Operator) -> Self {
        Directive::ConnectedOperator(operator)
    }
}

impl fmt::Debug for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::ScanFilter(_) => f.write_str("ScanFilter(..)"),
            Directive::Addresses(addresses) => f.debug_tuple("Addresses").field(addresses).finish(),
            Directive::ConnectedOperator(op) => {
                f.debug_tuple("ConnectedOperator").field(&op.name()).finish()
            }
        }
    }
}

/// Directives partitioned by kind.
#[derive(Default, Clone)]
pub struct CompiledDirectives {
    pub scan_filters: Vec<ScanFilter>,
    pub addresses: Vec<DeviceAddress>,
    pub operators: Vec<Operator>,
}

impl CompiledDirectives {
    pub fn compile(directives: impl IntoIterator<Item = Directive>) -> Self {
        let mut compiled = Self::default();
        for directive in directives {
            match directive {
                Directive::ScanFilter(f) => compiled.scan_filters.push(f),
                Directive::Addresses(a) => compiled.addresses.extend(a),
                Directive::ConnectedOperator(op) => compiled.operators.push(op),
            }
        }
        compiled
    }

    /// An explicit address list without any scan filter is authoritative.
    pub fn skips_scan(&self) -> bool {
        self.scan_filters.is_empty() && !self.addresses.is_empty()
    }

    /// The filters to scan with, or `None` when there is nothing to scan for.
    pub fn scan_filters(&self) -> Option<&[ScanFilter]> {
        (!self.skips_scan()).then_some(self.scan_filters.as_slice())
    }
}

/// Result of processing one device.
#[derive(Debug)]
pub struct DeviceOutcome {
    pub device_id: DeviceId,
    pub address: DeviceAddress,
    pub result: Result<(), GatewayError>,
}

#[derive(Debug, Default)]
pub struct FleetReport {
    pub devices: Vec<DeviceOutcome>,
}

impl FleetReport {
    pub fn addresses(&self) -> Vec<DeviceAddress> {
        self.devices.iter().map(|d| d.address).collect()
    }

    pub fn succeeded(&self) -> usize {
        self.devices.iter().filter(|d| d.result.is_ok()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &DeviceOutcome> {
        self.devices.iter().filter(|d| d.result.is_err())
    }
}

/// Runs compiled directives against the fleet, one device at a time.
#[derive(Clone)]
pub struct DirectiveRunner {
    discovery: DiscoveryEngine,
    sessions: SessionManager,
    handler: Arc<dyn MessageHandler>,
    config: Arc<GatewayConfig>,
    shutdown: Shutdown,
}

impl DirectiveRunner {
    pub fn new(
        discovery: DiscoveryEngine,
        sessions: SessionManager,
        handler: Arc<dyn MessageHandler>,
        config: Arc<GatewayConfig>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            discovery,
            sessions,
            handler,
            config,
            shutdown,
        }
    }

    pub async fn run(
        &self,
        directives: impl IntoIterator<Item = Directive>,
    ) -> Result<FleetReport, GatewayError> {
        let compiled = CompiledDirectives::compile(directives);
        debug!(
            target: "Gateway/Directive",
            "{} scan filters, {} explicit addresses, operators {:?}",
            compiled.scan_filters.len(),
            compiled.addresses.len(),
            compiled.operators.iter().map(Operator::name).collect::<Vec<_>>()
        );

        let scanned = self.discovery.scan_filtered(compiled.scan_filters()).await?;
        let targets = merge_addresses(&compiled.addresses, scanned.addresses());
        info!(
            target: "Gateway/Directive",
            "Processing {} devices ({} discovered)",
            targets.len(),
            scanned.len()
        );

        let mut report = FleetReport::default();
        for address in targets {
            let device_id = address.to_device_id();
            info!(target: "Gateway/Directive", "{device_id}");

            let result = if compiled.operators.is_empty() {
                Ok(())
            } else if self.shutdown.is_triggered() {
                Err(GatewayError::Cancelled)
            } else {
                self.run_operators(address, &compiled.operators).await
            };
            match &result {
                Ok(()) => {}
                Err(GatewayError::Cancelled) => return Err(GatewayError::Cancelled),
                Err(e) => error!(target: "Gateway/Directive", "{device_id}: {e}"),
            }
            report.devices.push(DeviceOutcome {
                device_id,
                address,
                result,
            });
        }
        Ok(report)
    }

    async fn run_operators(
        &self,
        address: DeviceAddress,
        operators: &[Operator],
    ) -> Result<(), GatewayError> {
        let settle = self.config.operator_settle;
        self.sessions
            .with_session(address, self.handler.clone(), |session| async move {
                for op in operators {
                    debug!(target: "Gateway/Directive", "Running {} on {}", op.name(), session.device_id());
                    op.run(session.clone())
                        .await
                        .with_context(|| format!("operator {}", op.name()))?;
                    tokio::time::sleep(settle).await;
                }
                Ok(())
            })
            .await
    }
}

/// Explicit addresses first, then newly discovered ones, without repeats.
fn merge_addresses(explicit: &[DeviceAddress], discovered: Vec<DeviceAddress>) -> Vec<DeviceAddress> {
    let mut seen = HashSet::new();
    explicit
        .iter()
        .copied()
        .chain(discovered)
        .filter(|a| seen.insert(*a))
        .collect()
}

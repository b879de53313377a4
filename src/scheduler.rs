//! Randomized fleet health checks.
//!
//! A round discovers the fleet, samples devices with replacement and
//! dispatches their tests at Poisson arrival times, one test at a time so
//! the radio never holds more than one connection.

use crate::codec::encoded_now;
use crate::config::GatewayConfig;
use crate::discovery::DiscoveryEngine;
use crate::error::GatewayError;
use crate::identity::{DeviceAddress, DeviceId};
use crate::session::{MessageHandler, SessionManager};
use crate::shutdown::Shutdown;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, sleep_until, timeout};

/// Picks `n` devices uniformly at random, duplicates allowed.
pub fn sample_with_replacement<R: Rng + ?Sized>(
    devices: &[DeviceAddress],
    n: usize,
    rng: &mut R,
) -> Vec<DeviceAddress> {
    if devices.is_empty() {
        return Vec::new();
    }
    (0..n)
        .map(|_| devices[rng.random_range(0..devices.len())])
        .collect()
}

/// Mean time between consecutive tests so that, on average, each device
/// is tested once per `target_avg_test_duration`. `None` when there is
/// nothing to test; an error when the gap does not fit a `Duration`.
pub fn average_gap(
    sample_size: usize,
    discovered: usize,
    target_avg_test_duration: Duration,
) -> Result<Option<Duration>, GatewayError> {
    if sample_size == 0 || discovered == 0 {
        return Ok(None);
    }
    let secs = target_avg_test_duration.as_secs_f64() * (sample_size as f64 / discovered as f64);
    Duration::try_from_secs_f64(secs).map(Some).map_err(|e| {
        GatewayError::Config(format!(
            "average test gap for {sample_size} of {discovered} devices every \
             {target_avg_test_duration:?} is out of range: {e}"
        ))
    })
}

/// One exponentially distributed inter-arrival gap with the given mean.
/// Saturates at `Duration::MAX`.
pub fn exponential_gap<R: Rng + ?Sized>(mean: Duration, rng: &mut R) -> Duration {
    let u: f64 = rng.random();
    // ln(1 - u) is never positive; abs() also turns -0.0 into 0.0.
    let scale = (1.0 - u).ln().abs();
    Duration::try_from_secs_f64(mean.as_secs_f64() * scale).unwrap_or(Duration::MAX)
}

/// Dispatch offsets from the start of a round. The first test starts
/// immediately and each further test one exponential gap after the last.
pub fn dispatch_offsets<R: Rng + ?Sized>(n: usize, mean: Duration, rng: &mut R) -> Vec<Duration> {
    let mut at = Duration::ZERO;
    (0..n)
        .map(|_| {
            let this = at;
            at = at.saturating_add(exponential_gap(mean, rng));
            this
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub address: DeviceAddress,
    pub offset: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestPlan {
    pub average_gap: Duration,
    pub dispatches: Vec<Dispatch>,
}

/// What a successful device test reported.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReport {
    pub device_id: DeviceId,
    pub characteristics: Vec<String>,
}

#[derive(Debug)]
pub struct TestOutcome {
    pub address: DeviceAddress,
    pub offset: Duration,
    pub result: Result<DeviceReport, GatewayError>,
}

impl TestOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct TestScheduler {
    discovery: DiscoveryEngine,
    sessions: SessionManager,
    handler: Arc<dyn MessageHandler>,
    config: Arc<GatewayConfig>,
    shutdown: Shutdown,
    rng: Mutex<StdRng>,
}

impl TestScheduler {
    pub fn new(
        discovery: DiscoveryEngine,
        sessions: SessionManager,
        handler: Arc<dyn MessageHandler>,
        config: Arc<GatewayConfig>,
        shutdown: Shutdown,
    ) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            discovery,
            sessions,
            handler,
            config,
            shutdown,
            rng: Mutex::new(rng),
        }
    }

    pub fn plan(
        &self,
        discovered: &[DeviceAddress],
        target_avg_test_duration: Duration,
        sample_size: usize,
    ) -> Result<Option<TestPlan>, GatewayError> {
        let Some(average_gap) = average_gap(sample_size, discovered.len(), target_avg_test_duration)?
        else {
            return Ok(None);
        };
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let sample = sample_with_replacement(discovered, sample_size, &mut *rng);
        let offsets = dispatch_offsets(sample.len(), average_gap, &mut *rng);
        Ok(Some(TestPlan {
            average_gap,
            dispatches: sample
                .into_iter()
                .zip(offsets)
                .map(|(address, offset)| Dispatch { address, offset })
                .collect(),
        }))
    }

    /// Runs one round of tests and returns each test's outcome in dispatch
    /// order. Failing devices are reported, not fatal.
    pub async fn run_tests(
        &self,
        target_avg_test_duration: Duration,
        sample_size: usize,
    ) -> Result<Vec<TestOutcome>, GatewayError> {
        let discovered = self.discovery.scan_all().await?.addresses();
        let Some(plan) = self.plan(&discovered, target_avg_test_duration, sample_size)? else {
            info!(target: "Gateway/Scheduler", "Nothing to test ({} devices discovered)", discovered.len());
            return Ok(Vec::new());
        };
        info!(
            target: "Gateway/Scheduler",
            "Testing {} of {} devices, one every {:?} on average",
            plan.dispatches.len(),
            discovered.len(),
            plan.average_gap
        );

        let round_start = Instant::now();
        let mut outcomes = Vec::with_capacity(plan.dispatches.len());
        for Dispatch { address, offset } in plan.dispatches {
            let Some(due) = round_start.checked_add(offset) else {
                warn!(
                    target: "Gateway/Scheduler",
                    "Dispatch offset {offset:?} is beyond the clock's range, ending the round"
                );
                break;
            };
            tokio::select! {
                _ = self.shutdown.wait() => return Err(GatewayError::Cancelled),
                _ = sleep_until(due) => {}
            }

            let result = self.test_device(address).await;
            match &result {
                Ok(_) => info!(target: "Gateway/Scheduler", "{} OK", address.to_device_id()),
                Err(GatewayError::Cancelled) => return Err(GatewayError::Cancelled),
                Err(e) => warn!(
                    target: "Gateway/Scheduler",
                    "Test of {} failed: {e}",
                    address.to_device_id()
                ),
            }
            outcomes.push(TestOutcome {
                address,
                offset,
                result,
            });
        }
        Ok(outcomes)
    }

    /// Enables logging, lets the device log for `logging_window`, disables
    /// logging (which makes it dump its logs), reports the sensor
    /// characteristics and waits for the dump to arrive.
    pub async fn test_device(&self, address: DeviceAddress) -> Result<DeviceReport, GatewayError> {
        let logging_window = self.config.logging_window;
        let reply_timeout = self.config.drain_timeout;
        self.sessions
            .with_session(address, self.handler.clone(), |session| async move {
                let is_logging = session.attributes().is_logging;

                session.write(is_logging, &encoded_now()).await?;
                info!(target: "Gateway/Scheduler", "Logging enabled on {}", session.device_id());
                tokio::time::sleep(logging_window).await;

                session.write_expecting_reply(is_logging, &[0x00]).await?;
                info!(target: "Gateway/Scheduler", "Logging disabled on {}", session.device_id());

                let characteristics = session.describe_characteristics().await?;
                info!(
                    target: "Gateway/Scheduler",
                    "{}\n{}",
                    session.address(),
                    characteristics
                        .iter()
                        .map(|c| format!("    {c}"))
                        .collect::<Vec<_>>()
                        .join("\n")
                );

                timeout(reply_timeout, session.confirmations().wait_until_settled())
                    .await
                    .map_err(|_| {
                        anyhow::anyhow!(
                            "{} replies still missing after {reply_timeout:?}",
                            session.confirmations().pending()
                        )
                    })?;
                Ok(DeviceReport {
                    device_id: session.device_id().clone(),
                    characteristics,
                })
            })
            .await
    }
}

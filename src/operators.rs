//! Actions run against a connected device.

use crate::codec::{AttributeWrite, encoded_now};
use crate::config::AttributeTable;
use crate::error::GatewayError;
use crate::session::Session;
use futures_util::future::BoxFuture;
use log::info;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

type OperatorFn = dyn Fn(Session) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// A named action applied to a live session.
#[derive(Clone)]
pub struct Operator {
    name: String,
    run: Arc<OperatorFn>,
}

impl Operator {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(move |session| Box::pin(f(session))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(&self, session: Session) -> anyhow::Result<()> {
        (self.run)(session).await
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Operator").field(&self.name).finish()
    }
}

pub fn noop() -> Operator {
    Operator::new("noop", |_| async { Ok(()) })
}

/// Logs every characteristic of the sensor service.
pub fn list_characteristics() -> Operator {
    Operator::new("list", |session: Session| async move {
        let lines = session.describe_characteristics().await?;
        info!(
            target: "Gateway/Operator",
            "{}\n{}",
            session.device_id(),
            lines
                .iter()
                .map(|l| format!("    {l}"))
                .collect::<Vec<_>>()
                .join("\n")
        );
        Ok(())
    })
}

/// Starts a logging run, stamped with the current time.
pub fn enable_logging() -> Operator {
    Operator::new("enable-logging", |session: Session| async move {
        let attribute = session.attributes().is_logging;
        session.write(attribute, &encoded_now()).await?;
        Ok(())
    })
}

/// Stops logging. The device answers by dumping its log files.
pub fn disable_logging() -> Operator {
    Operator::new("disable-logging", |session: Session| async move {
        let attribute = session.attributes().is_logging;
        session.write(attribute, &[0x00]).await?;
        Ok(())
    })
}

pub fn finalize_o2_calibration() -> Operator {
    stamp_now("finalize-o2", |attributes| attributes.last_o2_calibration)
}

pub fn finalize_ph_calibration() -> Operator {
    stamp_now("finalize-ph", |attributes| attributes.last_ph_calibration)
}

fn stamp_now(name: &str, attribute: fn(&AttributeTable) -> Uuid) -> Operator {
    Operator::new(name, move |session: Session| async move {
        let attribute = attribute(session.attributes());
        session.write(attribute, &encoded_now()).await?;
        Ok(())
    })
}

/// One point of the sensor calibration procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStep {
    O2ZeroPercent = 1,
    O2HundredPercent = 2,
    PhLow = 3,
    PhHigh = 4,
    PhOffset = 5,
}

impl CalibrationStep {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CalibrationStep {
    type Error = GatewayError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::O2ZeroPercent),
            2 => Ok(Self::O2HundredPercent),
            3 => Ok(Self::PhLow),
            4 => Ok(Self::PhHigh),
            5 => Ok(Self::PhOffset),
            _ => Err(GatewayError::InvalidOperator(format!("calibrate={code}"))),
        }
    }
}

impl FromStr for CalibrationStep {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "o2-0" => Ok(Self::O2ZeroPercent),
            "o2-100" => Ok(Self::O2HundredPercent),
            "ph-low" => Ok(Self::PhLow),
            "ph-high" => Ok(Self::PhHigh),
            "ph-offset" => Ok(Self::PhOffset),
            other => other
                .parse::<u8>()
                .map_err(|_| GatewayError::InvalidOperator(format!("calibrate={other}")))
                .and_then(Self::try_from),
        }
    }
}

pub fn calibrate(step: CalibrationStep) -> Operator {
    Operator::new(format!("calibrate={}", step.code()), move |session: Session| async move {
        let attribute = session.attributes().calibration;
        let value = AttributeWrite::Unsigned(u64::from(step.code())).encode();
        session.write(attribute, &value).await?;
        Ok(())
    })
}

pub fn write_characteristic(attribute: Uuid, value: AttributeWrite) -> Operator {
    Operator::new(format!("write:{attribute}"), move |session: Session| {
        let value = value.encode();
        async move {
            session.write(attribute, &value).await?;
            Ok(())
        }
    })
}

/// Textual form of an operator, as given on the command line.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorSpec {
    Noop,
    List,
    EnableLogging,
    DisableLogging,
    FinalizeO2,
    FinalizePh,
    Calibrate(CalibrationStep),
    Write { attribute: String, value: AttributeWrite },
}

impl FromStr for OperatorSpec {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let spec = match s {
            "noop" => Self::Noop,
            "list" => Self::List,
            "enable-logging" => Self::EnableLogging,
            "disable-logging" => Self::DisableLogging,
            "finalize-o2" => Self::FinalizeO2,
            "finalize-ph" => Self::FinalizePh,
            _ => {
                if let Some(step) = s.strip_prefix("calibrate=") {
                    Self::Calibrate(step.parse()?)
                } else if let Some((attribute, value)) =
                    s.strip_prefix("write:").and_then(|rest| rest.split_once('='))
                {
                    if attribute.is_empty() {
                        return Err(GatewayError::InvalidOperator(s.to_string()));
                    }
                    Self::Write {
                        attribute: attribute.to_string(),
                        value: AttributeWrite::parse_lenient(value),
                    }
                } else {
                    return Err(GatewayError::InvalidOperator(s.to_string()));
                }
            }
        };
        Ok(spec)
    }
}

impl OperatorSpec {
    /// Builds the operator, resolving attribute names against `attributes`.
    pub fn into_operator(self, attributes: &AttributeTable) -> Result<Operator, GatewayError> {
        Ok(match self {
            Self::Noop => noop(),
            Self::List => list_characteristics(),
            Self::EnableLogging => enable_logging(),
            Self::DisableLogging => disable_logging(),
            Self::FinalizeO2 => finalize_o2_calibration(),
            Self::FinalizePh => finalize_ph_calibration(),
            Self::Calibrate(step) => calibrate(step),
            Self::Write { attribute, value } => {
                let uuid = attributes.by_name(&attribute).ok_or_else(|| {
                    GatewayError::InvalidOperator(format!("unknown attribute '{attribute}'"))
                })?;
                write_characteristic(uuid, value)
            }
        })
    }
}

use crate::identity::{DeviceAddress, DeviceId};
use crate::transport::TransportError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to connect to {address} after {attempts} attempts: {source}")]
    ConnectionFailure {
        address: DeviceAddress,
        attempts: u32,
        /// Why the last attempt failed.
        #[source]
        source: TransportError,
    },
    #[error("malformed device id '{0}'")]
    MalformedId(String),
    #[error("malformed device address '{0}'")]
    MalformedAddress(String),
    #[error("invalid operator '{0}'")]
    InvalidOperator(String),
    #[error("operator failed on {device}: {source:#}")]
    Operator {
        device: DeviceId,
        #[source]
        source: anyhow::Error,
    },
    #[error("message handler failed on {device}: {source:#}")]
    Handler {
        device: DeviceId,
        #[source]
        source: anyhow::Error,
    },
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("{device} still had {pending} undelivered bytes after {waited:?}")]
    DrainTimeout {
        device: DeviceId,
        pending: usize,
        waited: Duration,
    },
    #[error("notification stream of {device} closed with {pending} undelivered bytes")]
    DrainClosed { device: DeviceId, pending: usize },
    #[error("operation cancelled")]
    Cancelled,
    #[error("record store error: {0:#}")]
    Store(#[source] anyhow::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

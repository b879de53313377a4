//! Mapping between link-layer addresses and textual device identifiers.
//!
//! A device id is `02-` followed by the 6 address octets in reverse
//! (least significant first) order as lowercase hex, which is how the
//! sensor firmware prints its own id.

use crate::error::GatewayError;
use std::fmt;
use std::str::FromStr;

pub const DEVICE_ID_PREFIX: &str = "02-";
pub const ADDRESS_LEN: usize = 6;

const DEVICE_ID_LEN: usize = DEVICE_ID_PREFIX.len() + ADDRESS_LEN * 2;

/// A 6-byte link-layer address, stored in display order (`AA:BB:..`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress([u8; ADDRESS_LEN]);

impl DeviceAddress {
    pub const fn new(octets: [u8; ADDRESS_LEN]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; ADDRESS_LEN] {
        self.0
    }

    pub fn to_device_id(&self) -> DeviceId {
        address_to_id(*self)
    }
}

impl From<[u8; ADDRESS_LEN]> for DeviceAddress {
    fn from(octets: [u8; ADDRESS_LEN]) -> Self {
        Self(octets)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for DeviceAddress {
    type Err = GatewayError;

    /// Parses `AA:BB:CC:DD:EE:FF` (case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || GatewayError::MalformedAddress(s.to_string());
        let mut octets = [0u8; ADDRESS_LEN];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(malformed)?;
            if part.len() != 2 {
                return Err(malformed());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| malformed())?;
        }
        if parts.next().is_some() {
            return Err(malformed());
        }
        Ok(Self(octets))
    }
}

/// Textual device identifier, e.g. `02-ffeeddccbbaa`.
///
/// Always built from an address, so the text is canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    text: String,
    address: DeviceAddress,
}

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn to_address(&self) -> DeviceAddress {
        self.address
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for DeviceId {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        id_to_address(s).map(address_to_id)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.text
    }
}

pub fn address_to_id(address: DeviceAddress) -> DeviceId {
    let mut octets = address.0;
    octets.reverse();
    DeviceId {
        text: format!("{DEVICE_ID_PREFIX}{}", hex::encode(octets)),
        address,
    }
}

/// Only lowercase hex is accepted so that ids stay canonical.
pub fn id_to_address(id: &str) -> Result<DeviceAddress, GatewayError> {
    let malformed = || GatewayError::MalformedId(id.to_string());
    if id.len() != DEVICE_ID_LEN || !id.starts_with(DEVICE_ID_PREFIX) {
        return Err(malformed());
    }
    let digits = &id[DEVICE_ID_PREFIX.len()..];
    if !digits
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(malformed());
    }

    let mut octets = [0u8; ADDRESS_LEN];
    hex::decode_to_slice(digits, &mut octets).map_err(|_| malformed())?;
    octets.reverse();
    Ok(DeviceAddress(octets))
}

//! Attribute value encoding for writes and presentation-format driven
//! decoding for reads.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

// Presentation format codes from the Bluetooth assigned numbers.
const FORMAT_BOOLEAN: u8 = 0x01;
const FORMAT_UNSIGNED_LAST: u8 = 0x0B;
const FORMAT_SIGNED_FIRST: u8 = 0x0C;
const FORMAT_SIGNED_LAST: u8 = 0x13;
const FORMAT_FLOAT32: u8 = 0x14;
const FORMAT_FLOAT64: u8 = 0x15;
const FORMAT_UTF8: u8 = 0x19;

/// A value that can be written to a device attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeWrite {
    Unsigned(u64),
    Float(f32),
    Text(String),
}

impl AttributeWrite {
    /// Integers become 8-byte little-endian, floats 4-byte little-endian
    /// IEEE-754 and text its UTF-8 bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            AttributeWrite::Unsigned(v) => v.to_le_bytes().to_vec(),
            AttributeWrite::Float(v) => v.to_le_bytes().to_vec(),
            AttributeWrite::Text(s) => s.as_bytes().to_vec(),
        }
    }

    /// Guesses the kind from its textual form: integer, then float, then text.
    pub fn parse_lenient(s: &str) -> Self {
        if let Ok(v) = s.parse::<u64>() {
            AttributeWrite::Unsigned(v)
        } else if let Ok(v) = s.parse::<f32>() {
            AttributeWrite::Float(v)
        } else {
            AttributeWrite::Text(s.to_string())
        }
    }
}

pub fn encode_value(value: &AttributeWrite) -> Vec<u8> {
    value.encode()
}

/// Milliseconds since the Unix epoch, the timestamp format the firmware expects.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub fn encoded_now() -> Vec<u8> {
    encode_value(&AttributeWrite::Unsigned(now_millis()))
}

/// A decoded attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Text(String),
    Raw(Vec<u8>),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Unsigned(v) => write!(f, "{v}"),
            AttributeValue::Signed(v) => write!(f, "{v}"),
            AttributeValue::Float(v) => write!(f, "{v}"),
            AttributeValue::Text(s) => f.write_str(s),
            AttributeValue::Raw(bytes) => write!(f, "0x{}", hex::encode(bytes)),
        }
    }
}

pub fn decode_attribute_value(format: u8, raw: &[u8]) -> AttributeValue {
    let decoded = match format {
        FORMAT_BOOLEAN..=FORMAT_UNSIGNED_LAST => le_unsigned(raw).map(AttributeValue::Unsigned),
        FORMAT_SIGNED_FIRST..=FORMAT_SIGNED_LAST => le_signed(raw).map(AttributeValue::Signed),
        FORMAT_FLOAT32 | FORMAT_FLOAT64 => le_float(raw).map(AttributeValue::Float),
        FORMAT_UTF8 => std::str::from_utf8(raw)
            .ok()
            .map(|s| AttributeValue::Text(s.trim_matches('\0').to_string())),
        _ => None,
    };
    decoded.unwrap_or_else(|| AttributeValue::Raw(raw.to_vec()))
}

fn le_unsigned(raw: &[u8]) -> Option<u64> {
    if raw.len() > 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf[..raw.len()].copy_from_slice(raw);
    Some(u64::from_le_bytes(buf))
}

fn le_signed(raw: &[u8]) -> Option<i64> {
    if raw.is_empty() || raw.len() > 8 {
        return None;
    }
    let fill = if raw[raw.len() - 1] & 0x80 != 0 { 0xFF } else { 0x00 };
    let mut buf = [fill; 8];
    buf[..raw.len()].copy_from_slice(raw);
    Some(i64::from_le_bytes(buf))
}

fn le_float(raw: &[u8]) -> Option<f64> {
    match raw.len() {
        4 => Some(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64),
        8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(raw);
            Some(f64::from_le_bytes(buf))
        }
        _ => None,
    }
}

/// A characteristic of the sensor service as described by its descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub description: String,
    pub presentation_format: u8,
}

impl CharacteristicInfo {
    /// Renders `"<description>: <value>"` for a raw value of this characteristic.
    pub fn describe(&self, raw: &[u8]) -> String {
        format!(
            "{}: {}",
            self.description,
            decode_attribute_value(self.presentation_format, raw)
        )
    }
}

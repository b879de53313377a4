use crate::error::GatewayError;
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

const SENSOR_UUID_BASE: u128 = 0x8067_0000_00bd_47bf_894a_2474_7d3c_58df;
const NORDIC_UART_UUID_BASE: u128 = 0x6e40_0000_b5a3_f393_e0a9_e50e_24dc_ca9e;

/// Expands a 16-bit short id into the sensor vendor UUID family.
pub const fn sensor_uuid(short: u16) -> Uuid {
    Uuid::from_u128(SENSOR_UUID_BASE | ((short as u128) << 96))
}

pub const fn nordic_uart_uuid(short: u16) -> Uuid {
    Uuid::from_u128(NORDIC_UART_UUID_BASE | ((short as u128) << 96))
}

/// GATT attribute identifiers exposed by the sensor firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeTable {
    pub service: Uuid,
    pub uart_service: Uuid,
    pub uart_rx: Uuid,
    pub uart_tx: Uuid,
    pub is_logging: Uuid,
    pub sampling_period: Uuid,
    pub temperature: Uuid,
    pub calibration: Uuid,
    pub last_o2_calibration: Uuid,
    pub last_ph_calibration: Uuid,
    pub device_label: Uuid,
    pub temperature_calibration: [Uuid; 3],
}

impl Default for AttributeTable {
    fn default() -> Self {
        Self {
            service: sensor_uuid(0x00bd),
            uart_service: nordic_uart_uuid(0x0001),
            uart_rx: nordic_uart_uuid(0x0002),
            uart_tx: nordic_uart_uuid(0x0003),
            is_logging: sensor_uuid(0x2c7b),
            sampling_period: sensor_uuid(0x92f3),
            temperature: sensor_uuid(0x9eba),
            calibration: sensor_uuid(0xe113),
            last_o2_calibration: sensor_uuid(0x7fca),
            last_ph_calibration: sensor_uuid(0x8c8e),
            device_label: sensor_uuid(0xa5dd),
            temperature_calibration: [
                sensor_uuid(0x3d3c),
                sensor_uuid(0xf912),
                sensor_uuid(0xe7cf),
            ],
        }
    }
}

impl AttributeTable {
    /// Resolves a kebab-case attribute name, or a literal UUID.
    pub fn by_name(&self, name: &str) -> Option<Uuid> {
        let uuid = match name {
            "is-logging" => self.is_logging,
            "sampling-period" => self.sampling_period,
            "temperature" => self.temperature,
            "calibration" => self.calibration,
            "last-o2-calibration" => self.last_o2_calibration,
            "last-ph-calibration" => self.last_ph_calibration,
            "device-label" => self.device_label,
            "temperature-calibration-0" => self.temperature_calibration[0],
            "temperature-calibration-1" => self.temperature_calibration[1],
            "temperature-calibration-2" => self.temperature_calibration[2],
            other => return Uuid::parse_str(other).ok(),
        };
        Some(uuid)
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub attributes: AttributeTable,
    pub max_connect_attempts: u32,
    pub connect_timeout: Duration,
    /// Silence needed before a scan is considered settled.
    pub debounce_window: Duration,
    pub max_scan_duration: Duration,
    /// Only devices advertising this service are reported by discovery.
    pub required_service: Option<Uuid>,
    /// Pause after each connected-device operator.
    pub operator_settle: Duration,
    /// How long logging stays enabled during a device test.
    pub logging_window: Duration,
    /// Upper bound on waiting for a half-received message when a session closes.
    pub drain_timeout: Duration,
    pub rng_seed: Option<u64>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let attributes = AttributeTable::default();
        Self {
            required_service: Some(attributes.service),
            attributes,
            max_connect_attempts: 10,
            connect_timeout: Duration::from_secs(10),
            debounce_window: Duration::from_secs(5),
            max_scan_duration: Duration::from_secs(60),
            operator_settle: Duration::from_secs(2),
            logging_window: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(60),
            rng_seed: None,
        }
    }
}

/// On-disk form of [`GatewayConfig`]; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    max_connect_attempts: Option<u32>,
    connect_timeout_ms: Option<u64>,
    debounce_window_ms: Option<u64>,
    max_scan_duration_ms: Option<u64>,
    #[serde(deserialize_with = "present_or_null")]
    required_service: Option<Option<Uuid>>,
    operator_settle_ms: Option<u64>,
    logging_window_ms: Option<u64>,
    drain_timeout_ms: Option<u64>,
    rng_seed: Option<u64>,
}

/// Distinguishes an explicit `null` (no service filter) from a missing field.
fn present_or_null<'de, D>(deserializer: D) -> Result<Option<Option<Uuid>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Uuid>::deserialize(deserializer).map(Some)
}

impl GatewayConfig {
    pub fn from_json_str(json: &str) -> Result<Self, GatewayError> {
        let file: ConfigFile =
            serde_json::from_str(json).map_err(|e| GatewayError::Config(e.to_string()))?;
        let mut config = Self::default();

        if let Some(v) = file.max_connect_attempts {
            config.max_connect_attempts = v;
        }
        let ms = Duration::from_millis;
        if let Some(v) = file.connect_timeout_ms {
            config.connect_timeout = ms(v);
        }
        if let Some(v) = file.debounce_window_ms {
            config.debounce_window = ms(v);
        }
        if let Some(v) = file.max_scan_duration_ms {
            config.max_scan_duration = ms(v);
        }
        if let Some(v) = file.required_service {
            config.required_service = v;
        }
        if let Some(v) = file.operator_settle_ms {
            config.operator_settle = ms(v);
        }
        if let Some(v) = file.logging_window_ms {
            config.logging_window = ms(v);
        }
        if let Some(v) = file.drain_timeout_ms {
            config.drain_timeout = ms(v);
        }
        if file.rng_seed.is_some() {
            config.rng_seed = file.rng_seed;
        }

        config.validate()?;
        Ok(config)
    }

    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.max_connect_attempts == 0 {
            return Err(GatewayError::Config(
                "max_connect_attempts must be at least 1".into(),
            ));
        }
        if self.debounce_window.is_zero() {
            return Err(GatewayError::Config("debounce_window must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_uuids_match_firmware() {
        let table = AttributeTable::default();
        assert_eq!(
            table.service.to_string(),
            "806700bd-00bd-47bf-894a-24747d3c58df"
        );
        assert_eq!(
            table.is_logging.to_string(),
            "80672c7b-00bd-47bf-894a-24747d3c58df"
        );
        assert_eq!(
            table.uart_tx.to_string(),
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }

    #[test]
    fn test_attribute_lookup_by_name() {
        let table = AttributeTable::default();
        assert_eq!(table.by_name("device-label"), Some(table.device_label));
        assert_eq!(
            table.by_name("temperature-calibration-2"),
            Some(table.temperature_calibration[2])
        );
        assert_eq!(
            table.by_name("6e400002-b5a3-f393-e0a9-e50e24dcca9e"),
            Some(table.uart_rx)
        );
        assert_eq!(table.by_name("nope"), None);
    }

    #[test]
    fn test_json_overrides_defaults() {
        let config = GatewayConfig::from_json_str(
            r#"{ "max_connect_attempts": 3, "drain_timeout_ms": 1500, "required_service": null }"#,
        )
        .unwrap();
        assert_eq!(config.max_connect_attempts, 3);
        assert_eq!(config.drain_timeout, Duration::from_millis(1500));
        assert_eq!(config.required_service, None);
        assert_eq!(config.debounce_window, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_json_config_is_rejected() {
        assert!(GatewayConfig::from_json_str(r#"{ "max_connect_attempts": 0 }"#).is_err());
        assert!(GatewayConfig::from_json_str(r#"{ "bogus": 1 }"#).is_err());
        assert!(GatewayConfig::from_json_str("not json").is_err());
    }
}

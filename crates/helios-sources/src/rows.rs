//! ---
//! ems_section: "03-protocol-adapters"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Typed configuration rows per protocol family."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

use helios_values::{Operator, SourceUsage};

fn default_factor() -> f64 {
    1.0
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_net_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_sma_port() -> u16 {
    9522
}

fn default_sma_group() -> Option<Ipv4Addr> {
    Some(Ipv4Addr::new(239, 12, 255, 254))
}

fn default_sma_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_sma_result_id() -> i64 {
    1
}

/// Modbus TCP device: one socket per source, one or more register reads
/// per poll.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusSourceConfig {
    pub host: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde(default = "default_net_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
    #[serde(default, rename = "result")]
    pub results: Vec<ModbusResultConfig>,
}

/// One register read within a Modbus source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusResultConfig {
    pub result_id: i64,
    pub usage: SourceUsage,
    pub address: u16,
    #[serde(default)]
    pub register: RegisterKind,
    pub data_type: DataType,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default = "default_factor")]
    pub correction_factor: f64,
    #[serde(default)]
    pub operator: Operator,
    /// Sign probe for devices that report unsigned magnitude only: read one
    /// extra register and negate the decoded value when it is non-zero.
    #[serde(default)]
    pub invert_by: Option<InvertProbe>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvertProbe {
    pub address: u16,
    #[serde(default)]
    pub register: RegisterKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    #[default]
    Holding,
    Input,
}

/// Numeric reinterpretation of the concatenated register bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
}

impl DataType {
    pub fn register_count(self) -> u16 {
        match self {
            DataType::Int16 | DataType::UInt16 => 1,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 2,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 4,
        }
    }

    pub fn byte_len(self) -> usize {
        self.register_count() as usize * 2
    }
}

/// Word/byte order on the wire. `Abcd` is straight big-endian; `Cdab`
/// devices need the full byte sequence reversed before reinterpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Abcd,
    Cdab,
}

/// REST/HTTP endpoint polled on an interval; every result row extracts one
/// number from the same response body.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestSourceConfig {
    pub url: String,
    #[serde(default)]
    pub headers: std::collections::BTreeMap<String, String>,
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde(default = "default_net_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
    #[serde(default, rename = "result")]
    pub results: Vec<TextResultConfig>,
}

/// One extraction from a text payload (REST body).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextResultConfig {
    pub result_id: i64,
    pub usage: SourceUsage,
    #[serde(flatten)]
    pub extraction: Extraction,
    #[serde(default = "default_factor")]
    pub correction_factor: f64,
    #[serde(default)]
    pub operator: Operator,
}

/// How a numeric reading is pulled out of a text payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Extraction {
    /// The whole payload is the number.
    Direct,
    /// Walk a `$.a.b[0].c` path through a JSON document.
    Json { path: String },
    /// Slash-separated tag path. A single match yields its text content;
    /// multiple matches are disambiguated by `header_name == header_value`
    /// and the reading is taken from `value_attribute`.
    Xml {
        path: String,
        #[serde(default)]
        header_name: Option<String>,
        #[serde(default)]
        header_value: Option<String>,
        #[serde(default)]
        value_attribute: Option<String>,
    },
}

/// MQTT broker subscription; each result row owns one topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSourceConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default, rename = "result")]
    pub results: Vec<MqttResultConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttResultConfig {
    pub result_id: i64,
    pub usage: SourceUsage,
    pub topic: String,
    #[serde(flatten)]
    pub extraction: Extraction,
    #[serde(default = "default_factor")]
    pub correction_factor: f64,
    #[serde(default)]
    pub operator: Operator,
}

/// Vendor energy meter broadcasting OBIS-like frames over UDP multicast.
/// The frame layout is fixed; only the socket parameters and calibration
/// are configurable. Leaving `group` empty skips the multicast join and
/// listens for unicast datagrams on the port, which is how bench setups
/// replay captured frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmaMeterConfig {
    #[serde(default = "default_sma_port")]
    pub port: u16,
    #[serde(default = "default_sma_group")]
    pub group: Option<Ipv4Addr>,
    #[serde(default = "default_sma_interface")]
    pub interface: Ipv4Addr,
    #[serde(default = "default_sma_result_id")]
    pub result_id: i64,
    #[serde(default = "default_factor")]
    pub correction_factor: f64,
    #[serde(default)]
    pub operator: Operator,
}

impl Default for SmaMeterConfig {
    fn default() -> Self {
        Self {
            port: default_sma_port(),
            group: default_sma_group(),
            interface: default_sma_interface(),
            result_id: default_sma_result_id(),
            correction_factor: default_factor(),
            operator: Operator::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modbus_row_parses_with_defaults() {
        let doc = r#"
            host = "10.0.0.20"

            [[result]]
            result_id = 1
            usage = "grid-power"
            address = 30775
            data_type = "int32"
        "#;
        let config: ModbusSourceConfig = toml::from_str(doc).unwrap();
        assert_eq!(config.port, 502);
        assert_eq!(config.unit_id, 1);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        let result = &config.results[0];
        assert_eq!(result.register, RegisterKind::Holding);
        assert_eq!(result.byte_order, ByteOrder::Abcd);
        assert_eq!(result.data_type.register_count(), 2);
        assert_eq!(result.correction_factor, 1.0);
        assert!(result.invert_by.is_none());
    }

    #[test]
    fn extraction_mode_tag_selects_the_variant() {
        let doc = r#"
            result_id = 2
            usage = "inverter-power"
            mode = "json"
            path = "$.data.value"
        "#;
        let result: TextResultConfig = toml::from_str(doc).unwrap();
        match result.extraction {
            Extraction::Json { ref path } => assert_eq!(path, "$.data.value"),
            ref other => panic!("unexpected extraction {:?}", other),
        }
    }

    #[test]
    fn sma_defaults_point_at_the_observed_deployment() {
        let config = SmaMeterConfig::default();
        assert_eq!(config.port, 9522);
        assert_eq!(config.group, Some(Ipv4Addr::new(239, 12, 255, 254)));
    }
}

//! ---
//! ems_section: "03-protocol-adapters"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Protocol adapters and configuration decoding."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Protocol adapters for the Helios engine. Each adapter translates typed
//! configuration rows into pull or push units; the rows themselves arrive as
//! untyped TOML blobs and are decoded through an explicit (kind, version)
//! registry.

pub mod extract;
pub mod modbus;
pub mod mqtt;
pub mod registry;
pub mod rest;
pub mod rows;
pub mod sma;
pub mod store;

pub use modbus::ModbusAdapter;
pub use mqtt::MqttAdapter;
pub use registry::{DecoderRegistry, SourceRow};
pub use rest::RestAdapter;
pub use rows::{
    ByteOrder, DataType, Extraction, InvertProbe, ModbusResultConfig, ModbusSourceConfig,
    MqttResultConfig, MqttSourceConfig, RegisterKind, RestSourceConfig, SmaMeterConfig,
    TextResultConfig,
};
pub use sma::SmaEnergyMeterAdapter;
pub use store::{DecodedSource, InMemorySourceStore, SourceConfigStore};

//! ---
//! ems_section: "03-protocol-adapters"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Explicit (kind, version) decode registry for configuration blobs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use helios_common::RawSourceConfig;
use helios_values::SourceKind;
use serde::de::DeserializeOwned;

use crate::rows::{ModbusSourceConfig, MqttSourceConfig, RestSourceConfig, SmaMeterConfig};

/// A fully decoded configuration row, ready for its protocol adapter.
#[derive(Debug, Clone)]
pub enum SourceRow {
    Modbus(ModbusSourceConfig),
    Rest(RestSourceConfig),
    Mqtt(MqttSourceConfig),
    SmaEnergyMeter(SmaMeterConfig),
}

impl SourceRow {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceRow::Modbus(_) => SourceKind::Modbus,
            SourceRow::Rest(_) => SourceKind::Rest,
            SourceRow::Mqtt(_) => SourceKind::Mqtt,
            SourceRow::SmaEnergyMeter(_) => SourceKind::SmaEnergyMeter,
        }
    }
}

pub type DecodeFn = fn(&RawSourceConfig) -> Result<SourceRow>;

/// Maps (kind, version) to a typed decode function, resolved once at
/// startup. An unsupported pairing is a registry miss, never a runtime
/// type lookup.
#[derive(Debug, Clone)]
pub struct DecoderRegistry {
    decoders: HashMap<(SourceKind, u32), DecodeFn>,
}

impl DecoderRegistry {
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registry carrying the current decoder set, one entry per supported
    /// (kind, version) pair.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(SourceKind::Modbus, 1, |raw| {
            Ok(SourceRow::Modbus(decode_params::<ModbusSourceConfig>(raw)?))
        });
        registry.register(SourceKind::Rest, 1, |raw| {
            Ok(SourceRow::Rest(decode_params::<RestSourceConfig>(raw)?))
        });
        registry.register(SourceKind::Mqtt, 1, |raw| {
            Ok(SourceRow::Mqtt(decode_params::<MqttSourceConfig>(raw)?))
        });
        registry.register(SourceKind::SmaEnergyMeter, 1, |raw| {
            Ok(SourceRow::SmaEnergyMeter(decode_params::<SmaMeterConfig>(
                raw,
            )?))
        });
        registry
    }

    pub fn register(&mut self, kind: SourceKind, version: u32, decode: DecodeFn) {
        self.decoders.insert((kind, version), decode);
    }

    pub fn supports(&self, kind: SourceKind, version: u32) -> bool {
        self.decoders.contains_key(&(kind, version))
    }

    /// Decode one raw row. Fails on an unknown kind label, an unregistered
    /// (kind, version) pair, or parameters that do not fit the typed row.
    pub fn decode(&self, raw: &RawSourceConfig) -> Result<SourceRow> {
        let kind: SourceKind = raw
            .kind
            .parse()
            .map_err(|err: String| anyhow!("source {}: {}", raw.source_id, err))?;
        let decode = self.decoders.get(&(kind, raw.version)).ok_or_else(|| {
            anyhow!(
                "no decoder registered for kind '{}' version {}",
                raw.kind,
                raw.version
            )
        })?;
        decode(raw)
    }
}

fn decode_params<T: DeserializeOwned>(raw: &RawSourceConfig) -> Result<T> {
    raw.params.clone().try_into().with_context(|| {
        format!(
            "parameters of source '{}/{}' do not match the version {} layout",
            raw.kind, raw.source_id, raw.version
        )
    })
}

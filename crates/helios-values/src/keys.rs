//! ---
//! ems_section: "01-value-engine"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Value and source key model."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical quantity category consumed by the charging control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceUsage {
    GridPower,
    InverterPower,
    HomeBatteryPower,
    HomeBatterySoc,
}

impl SourceUsage {
    pub const ALL: [SourceUsage; 4] = [
        SourceUsage::GridPower,
        SourceUsage::InverterPower,
        SourceUsage::HomeBatteryPower,
        SourceUsage::HomeBatterySoc,
    ];
}

impl fmt::Display for SourceUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SourceUsage::GridPower => "grid-power",
            SourceUsage::InverterPower => "inverter-power",
            SourceUsage::HomeBatteryPower => "home-battery-power",
            SourceUsage::HomeBatterySoc => "home-battery-soc",
        };
        f.write_str(label)
    }
}

/// Vehicle-reported quantity, kept distinct from the meter usages so a
/// single key space can carry both families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VehicleUsage {
    StateOfCharge,
    ChargeLimit,
}

/// Either a meter usage or a vehicle usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueUsage {
    Source(SourceUsage),
    Vehicle(VehicleUsage),
}

impl ValueUsage {
    pub fn as_source(&self) -> Option<SourceUsage> {
        match self {
            ValueUsage::Source(usage) => Some(*usage),
            ValueUsage::Vehicle(_) => None,
        }
    }
}

impl From<SourceUsage> for ValueUsage {
    fn from(usage: SourceUsage) -> Self {
        ValueUsage::Source(usage)
    }
}

impl From<VehicleUsage> for ValueUsage {
    fn from(usage: VehicleUsage) -> Self {
        ValueUsage::Vehicle(usage)
    }
}

/// Identifies one measured quantity within one source. A source may report
/// several keys, e.g. two inverter-power registers that are summed downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueKey {
    pub usage: ValueUsage,
    pub result_id: i64,
}

impl ValueKey {
    pub fn new(usage: impl Into<ValueUsage>, result_id: i64) -> Self {
        Self {
            usage: usage.into(),
            result_id,
        }
    }
}

/// Protocol family owning a configured source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Rest,
    Modbus,
    Mqtt,
    SmaEnergyMeter,
    Vehicle,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SourceKind::Rest => "rest",
            SourceKind::Modbus => "modbus",
            SourceKind::Mqtt => "mqtt",
            SourceKind::SmaEnergyMeter => "sma-energy-meter",
            SourceKind::Vehicle => "vehicle",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rest" => Ok(SourceKind::Rest),
            "modbus" => Ok(SourceKind::Modbus),
            "mqtt" => Ok(SourceKind::Mqtt),
            "sma-energy-meter" => Ok(SourceKind::SmaEnergyMeter),
            "vehicle" => Ok(SourceKind::Vehicle),
            other => Err(format!("unknown source kind: {}", other)),
        }
    }
}

/// Identifies one configured device/endpoint. At most one live unit exists
/// per source key at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub source_id: i64,
    pub kind: SourceKind,
}

impl SourceKey {
    pub fn new(source_id: i64, kind: SourceKind) -> Self {
        Self { source_id, kind }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.source_id)
    }
}

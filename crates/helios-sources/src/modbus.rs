//! ---
//! ems_section: "03-protocol-adapters"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Modbus TCP adapter: register reads and numeric decoding."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use async_trait::async_trait;
use helios_core::{SourceAdapter, SourceFilter, SourceUnit};
use helios_values::{apply_correction, FetchFn, PolledSource, SourceKey, SourceKind, ValueKey};
use tokio::time::timeout;
use tokio_modbus::prelude::*;

use crate::rows::{ByteOrder, DataType, ModbusResultConfig, ModbusSourceConfig, RegisterKind};
use crate::store::SourceConfigStore;

/// Concatenate raw register bytes, apply the configured byte order, and
/// reinterpret as the configured numeric type. `Cdab` devices deliver the
/// bytes fully reversed relative to big-endian.
pub fn decode_registers(registers: &[u16], data_type: DataType, byte_order: ByteOrder) -> Result<f64> {
    let mut bytes: Vec<u8> = registers
        .iter()
        .flat_map(|register| register.to_be_bytes())
        .collect();
    if bytes.len() != data_type.byte_len() {
        bail!(
            "expected {} register bytes for {:?}, got {}",
            data_type.byte_len(),
            data_type,
            bytes.len()
        );
    }
    if byte_order == ByteOrder::Cdab {
        bytes.reverse();
    }

    let value = match data_type {
        DataType::Int16 => i16::from_be_bytes(bytes.try_into().unwrap()) as f64,
        DataType::UInt16 => u16::from_be_bytes(bytes.try_into().unwrap()) as f64,
        DataType::Int32 => i32::from_be_bytes(bytes.try_into().unwrap()) as f64,
        DataType::UInt32 => u32::from_be_bytes(bytes.try_into().unwrap()) as f64,
        DataType::Int64 => i64::from_be_bytes(bytes.try_into().unwrap()) as f64,
        DataType::UInt64 => u64::from_be_bytes(bytes.try_into().unwrap()) as f64,
        DataType::Float32 => f32::from_be_bytes(bytes.try_into().unwrap()) as f64,
        DataType::Float64 => f64::from_be_bytes(bytes.try_into().unwrap()),
    };
    Ok(value)
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("cannot resolve {}:{}", host, port))?
        .next()
        .ok_or_else(|| anyhow!("{}:{} resolved to no address", host, port))
}

async fn read_registers(
    ctx: &mut client::Context,
    kind: RegisterKind,
    address: u16,
    count: u16,
    net_timeout: Duration,
) -> Result<Vec<u16>> {
    let read = async {
        match kind {
            RegisterKind::Holding => ctx.read_holding_registers(address, count).await,
            RegisterKind::Input => ctx.read_input_registers(address, count).await,
        }
    };
    timeout(net_timeout, read)
        .await
        .with_context(|| format!("register read at {} timed out", address))?
        .with_context(|| format!("register read at {} failed", address))
}

async fn read_result(
    ctx: &mut client::Context,
    result: &ModbusResultConfig,
    net_timeout: Duration,
) -> Result<f64> {
    let registers = read_registers(
        ctx,
        result.register,
        result.address,
        result.data_type.register_count(),
        net_timeout,
    )
    .await?;
    let mut raw = decode_registers(&registers, result.data_type, result.byte_order)?;

    if let Some(probe) = &result.invert_by {
        let probe_registers =
            read_registers(ctx, probe.register, probe.address, 1, net_timeout).await?;
        if probe_registers.first().copied().unwrap_or(0) != 0 {
            raw = -raw;
        }
    }
    Ok(apply_correction(
        raw,
        result.correction_factor,
        result.operator,
    ))
}

/// One poll: connect, read every configured result row over the same
/// socket, disconnect by drop.
async fn fetch(config: Arc<ModbusSourceConfig>) -> Result<HashMap<ValueKey, f64>> {
    let addr = resolve(&config.host, config.port).await?;
    let mut ctx = timeout(
        config.timeout,
        tcp::connect_slave(addr, Slave(config.unit_id)),
    )
    .await
    .with_context(|| format!("connect to {} timed out", addr))?
    .with_context(|| format!("connect to {} failed", addr))?;

    let mut values = HashMap::new();
    for result in &config.results {
        let value = read_result(&mut ctx, result, config.timeout).await?;
        values.insert(ValueKey::new(result.usage, result.result_id), value);
    }
    Ok(values)
}

/// Builds one pull unit per configured Modbus device.
pub struct ModbusAdapter {
    store: Arc<dyn SourceConfigStore>,
    history_capacity: usize,
}

impl ModbusAdapter {
    pub fn new(store: Arc<dyn SourceConfigStore>, history_capacity: usize) -> Self {
        Self {
            store,
            history_capacity,
        }
    }

    fn build_unit(&self, key: SourceKey, config: ModbusSourceConfig) -> SourceUnit {
        let interval = config.poll_interval;
        let config = Arc::new(config);
        let fetch_fn: Arc<FetchFn> = Arc::new(move |_token| {
            let config = config.clone();
            Box::pin(async move { fetch(config).await })
        });
        PolledSource::new(key, interval, self.history_capacity, fetch_fn).into()
    }
}

#[async_trait]
impl SourceAdapter for ModbusAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Modbus
    }

    async fn build_units(&self, filter: &SourceFilter) -> Result<Vec<SourceUnit>> {
        let rows = self.store.sources(filter).await?;
        let units = rows
            .into_iter()
            .filter_map(|decoded| match decoded.row {
                crate::registry::SourceRow::Modbus(config) => {
                    Some(self.build_unit(decoded.key, config))
                }
                _ => None,
            })
            .collect();
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DecoderRegistry;
    use crate::store::InMemorySourceStore;
    use helios_common::RawSourceConfig;

    #[test]
    fn int16_decodes_signed() {
        let raw = (-230i16) as u16;
        let value = decode_registers(&[raw], DataType::Int16, ByteOrder::Abcd).unwrap();
        assert_eq!(value, -230.0);
    }

    #[test]
    fn uint32_concatenates_big_endian_registers() {
        // 0x0001_0000 = 65536
        let value = decode_registers(&[0x0001, 0x0000], DataType::UInt32, ByteOrder::Abcd).unwrap();
        assert_eq!(value, 65536.0);
    }

    #[test]
    fn cdab_reverses_the_byte_sequence() {
        let big = 1065353216u32; // 1.0f32 bit pattern
        let be = big.to_be_bytes();
        let reversed = [be[3], be[2], be[1], be[0]];
        let registers = [
            u16::from_be_bytes([reversed[0], reversed[1]]),
            u16::from_be_bytes([reversed[2], reversed[3]]),
        ];
        let value = decode_registers(&registers, DataType::Float32, ByteOrder::Cdab).unwrap();
        assert_eq!(value, 1.0);
    }

    #[test]
    fn float64_uses_four_registers() {
        let bits = 2.5f64.to_be_bytes();
        let registers = [
            u16::from_be_bytes([bits[0], bits[1]]),
            u16::from_be_bytes([bits[2], bits[3]]),
            u16::from_be_bytes([bits[4], bits[5]]),
            u16::from_be_bytes([bits[6], bits[7]]),
        ];
        let value = decode_registers(&registers, DataType::Float64, ByteOrder::Abcd).unwrap();
        assert_eq!(value, 2.5);
    }

    #[test]
    fn wrong_register_count_is_rejected() {
        assert!(decode_registers(&[1, 2], DataType::Int16, ByteOrder::Abcd).is_err());
    }

    #[tokio::test]
    async fn adapter_builds_one_polled_unit_per_device() {
        let doc = r#"
            host = "10.0.0.20"
            poll_interval = 3

            [[result]]
            result_id = 1
            usage = "grid-power"
            address = 30775
            data_type = "int32"
        "#;
        let store = Arc::new(InMemorySourceStore::new(
            DecoderRegistry::with_defaults(),
            vec![RawSourceConfig {
                source_id: 5,
                kind: "modbus".into(),
                version: 1,
                params: toml::from_str(doc).unwrap(),
            }],
        ));
        let adapter = ModbusAdapter::new(store, 16);
        let units = adapter.build_units(&SourceFilter::all()).await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].key(), SourceKey::new(5, SourceKind::Modbus));
        let polled = units[0].as_polled().unwrap();
        assert_eq!(polled.interval(), Duration::from_secs(3));
    }
}

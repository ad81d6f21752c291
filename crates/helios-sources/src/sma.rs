//! ---
//! ems_section: "03-protocol-adapters"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Vendor energy-meter UDP multicast adapter and frame parser."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use helios_core::{SourceAdapter, SourceFilter, SourceUnit};
use helios_values::{
    apply_correction, ListenFn, ListeningSource, SourceKind, SourceState, SourceUsage, ValueKey,
};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::rows::SmaMeterConfig;
use crate::store::SourceConfigStore;

/// Anything shorter is a partial broadcast, silently dropped.
const MIN_FRAME_LEN: usize = 600;
const HEADER_LEN: usize = 28;
/// Channel identifiers above this terminate the record table.
const MAX_CHANNEL_ID: u16 = 100;
const SUPPLY_CHANNEL: u16 = 1;
const OVERAGE_CHANNEL: u16 = 2;

/// Instantaneous grid readings decoded from one frame, in watts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterReading {
    pub supply: f64,
    pub overage: f64,
}

impl MeterReading {
    /// Net grid power: feed-in minus draw.
    pub fn grid_power(&self) -> f64 {
        self.overage - self.supply
    }
}

fn be_unsigned(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// Decode one OBIS-like meter frame.
///
/// Record layout after the fixed header: 2-byte big-endian channel id,
/// 2 skipped bytes, then a length descriptor of which only the first byte
/// is meaningful while the cursor advances 2. This matches the frames the
/// meter actually emits; the vendor pads records to even boundaries, so
/// the extra byte is always absorbed. Do not "fix" the stride without
/// captures proving devices in the field changed.
///
/// A 4-byte value is an instantaneous reading, an 8-byte value a lifetime
/// counter; only the instantaneous supply/overage channels feed the grid
/// reading, both scaled from tenths of a watt.
pub fn parse_energy_meter_frame(frame: &[u8]) -> Option<MeterReading> {
    if frame.len() < MIN_FRAME_LEN {
        return None;
    }

    let mut supply = None;
    let mut overage = None;
    let mut cursor = HEADER_LEN;

    while cursor + 2 <= frame.len() {
        let id = u16::from_be_bytes([frame[cursor], frame[cursor + 1]]);
        if id > MAX_CHANNEL_ID {
            break;
        }
        cursor += 4; // id + 2 reserved bytes
        if cursor >= frame.len() {
            break;
        }
        let length = frame[cursor] as usize;
        cursor += 2;
        if !(length == 4 || length == 8) || cursor + length > frame.len() {
            break;
        }
        let value = be_unsigned(&frame[cursor..cursor + length]);
        cursor += length;

        // 4-byte records are instantaneous; counters are parsed but unused.
        if length == 4 {
            match id {
                SUPPLY_CHANNEL => supply = Some(value as f64 / 10.0),
                OVERAGE_CHANNEL => overage = Some(value as f64 / 10.0),
                _ => {}
            }
        }
    }

    match (supply, overage) {
        (Some(supply), Some(overage)) => Some(MeterReading { supply, overage }),
        _ => None,
    }
}

/// Datagram loop: join the multicast group (or listen unicast when no
/// group is configured) and fold every complete frame into the grid-power
/// buffer. A pre-bound socket, when present, is consumed on the first
/// start; later restarts bind per the configuration again.
async fn listen(
    config: Arc<SmaMeterConfig>,
    preset: Arc<Mutex<Option<UdpSocket>>>,
    state: Arc<SourceState>,
    token: CancellationToken,
) -> Result<()> {
    let preset_socket = preset.lock().take();
    let socket = match preset_socket {
        Some(socket) => socket,
        None => UdpSocket::bind((config.interface, config.port))
            .await
            .with_context(|| format!("cannot bind udp port {}", config.port))?,
    };
    if let Some(group) = config.group {
        socket
            .join_multicast_v4(group, config.interface)
            .with_context(|| format!("cannot join multicast group {}", group))?;
        debug!(source = %state.key(), %group, port = config.port, "joined meter multicast group");
    }

    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            received = socket.recv_from(&mut buf) => {
                let (len, _peer) = received.context("udp receive failed")?;
                let Some(reading) = parse_energy_meter_frame(&buf[..len]) else {
                    trace!(source = %state.key(), len, "incomplete meter frame dropped");
                    continue;
                };
                let value = apply_correction(
                    reading.grid_power(),
                    config.correction_factor,
                    config.operator,
                );
                state.update_value(
                    ValueKey::new(SourceUsage::GridPower, config.result_id),
                    Utc::now(),
                    value,
                );
                state.clear_error();
            }
        }
    }
}

/// Builds one push unit per configured meter feed.
pub struct SmaEnergyMeterAdapter {
    store: Arc<dyn SourceConfigStore>,
    history_capacity: usize,
}

impl SmaEnergyMeterAdapter {
    pub fn new(store: Arc<dyn SourceConfigStore>, history_capacity: usize) -> Self {
        Self {
            store,
            history_capacity,
        }
    }

    /// Exposed for bench/replay setups that feed captured frames to a
    /// unicast listener instead of the production multicast group.
    pub fn unit_for(
        key: helios_values::SourceKey,
        config: SmaMeterConfig,
        history_capacity: usize,
    ) -> SourceUnit {
        Self::build_unit(key, config, history_capacity, None)
    }

    /// Like [`Self::unit_for`], but listening on an already-bound socket.
    /// Binding on port 0 first lets the caller learn the effective port
    /// before any frame is sent.
    pub fn unit_on_socket(
        key: helios_values::SourceKey,
        config: SmaMeterConfig,
        history_capacity: usize,
        socket: UdpSocket,
    ) -> SourceUnit {
        Self::build_unit(key, config, history_capacity, Some(socket))
    }

    fn build_unit(
        key: helios_values::SourceKey,
        config: SmaMeterConfig,
        history_capacity: usize,
        preset: Option<UdpSocket>,
    ) -> SourceUnit {
        let config = Arc::new(config);
        let preset = Arc::new(Mutex::new(preset));
        let listen_fn: Arc<ListenFn> = Arc::new(move |state, token| {
            let config = config.clone();
            let preset = preset.clone();
            Box::pin(async move { listen(config, preset, state, token).await })
        });
        ListeningSource::new(key, history_capacity, listen_fn).into()
    }
}

#[async_trait]
impl SourceAdapter for SmaEnergyMeterAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::SmaEnergyMeter
    }

    async fn build_units(&self, filter: &SourceFilter) -> Result<Vec<SourceUnit>> {
        let rows = self.store.sources(filter).await?;
        let units = rows
            .into_iter()
            .filter_map(|decoded| match decoded.row {
                crate::registry::SourceRow::SmaEnergyMeter(config) => {
                    Some(Self::unit_for(decoded.key, config, self.history_capacity))
                }
                _ => None,
            })
            .collect();
        Ok(units)
    }
}

#[cfg(test)]
pub(crate) fn build_test_frame(entries: &[(u16, usize, u64)]) -> Vec<u8> {
    let mut frame = vec![0u8; HEADER_LEN];
    for (id, length, value) in entries {
        frame.extend_from_slice(&id.to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&[*length as u8, 0]);
        let bytes = value.to_be_bytes();
        frame.extend_from_slice(&bytes[bytes.len() - length..]);
    }
    // Terminator record, then vendor padding up to the broadcast size.
    frame.extend_from_slice(&36864u16.to_be_bytes());
    if frame.len() < MIN_FRAME_LEN {
        frame.resize(MIN_FRAME_LEN, 0);
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_frame_is_silently_dropped() {
        let frame = vec![0u8; MIN_FRAME_LEN - 1];
        assert_eq!(parse_energy_meter_frame(&frame), None);
    }

    #[test]
    fn supply_and_overage_scale_to_watts() {
        let frame = build_test_frame(&[
            (SUPPLY_CHANNEL, 4, 4000),  // 400.0 W draw
            (OVERAGE_CHANNEL, 4, 1000), // 100.0 W feed-in
        ]);
        let reading = parse_energy_meter_frame(&frame).unwrap();
        assert_eq!(reading.supply, 400.0);
        assert_eq!(reading.overage, 100.0);
        assert_eq!(reading.grid_power(), -300.0);
    }

    #[test]
    fn counter_records_do_not_shadow_instantaneous_ones() {
        let frame = build_test_frame(&[
            (SUPPLY_CHANNEL, 4, 250),
            (SUPPLY_CHANNEL, 8, 999_999_999),
            (OVERAGE_CHANNEL, 4, 0),
        ]);
        let reading = parse_energy_meter_frame(&frame).unwrap();
        assert_eq!(reading.supply, 25.0);
        assert_eq!(reading.overage, 0.0);
    }

    #[test]
    fn table_stops_at_the_first_high_identifier() {
        // The terminator precedes the overage record, so no reading forms.
        let mut frame = vec![0u8; HEADER_LEN];
        frame.extend_from_slice(&SUPPLY_CHANNEL.to_be_bytes());
        frame.extend_from_slice(&[0, 0, 4, 0]);
        frame.extend_from_slice(&100u32.to_be_bytes());
        frame.extend_from_slice(&36864u16.to_be_bytes());
        frame.extend_from_slice(&OVERAGE_CHANNEL.to_be_bytes());
        frame.extend_from_slice(&[0, 0, 4, 0]);
        frame.extend_from_slice(&100u32.to_be_bytes());
        frame.resize(MIN_FRAME_LEN, 0);
        assert_eq!(parse_energy_meter_frame(&frame), None);
    }

    #[test]
    fn frame_with_only_counters_yields_no_reading() {
        let frame = build_test_frame(&[(SUPPLY_CHANNEL, 8, 123), (OVERAGE_CHANNEL, 8, 456)]);
        assert_eq!(parse_energy_meter_frame(&frame), None);
    }
}

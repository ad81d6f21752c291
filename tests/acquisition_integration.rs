//! ---
//! ems_section: "05-testing"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "End-to-end acquisition tests against in-process fixtures."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use chrono::Utc;
use helios_common::RawSourceConfig;
use helios_core::{SourceAdapter, SourceFilter, SourceOrchestrator};
use helios_sources::{
    DecoderRegistry, InMemorySourceStore, RestAdapter, SmaEnergyMeterAdapter, SmaMeterConfig,
};
use helios_values::{Operator, SourceKey, SourceKind, SourceUsage, ValueKey};
use tokio_util::sync::CancellationToken;

const JSON_BODY: &str = r#"{"data":{"value":14}}"#;
const XML_BODY: &str = r#"<meter><reading Type="GridPower" Value="18.7"/><reading Type="InverterPower" Value="512"/></meter>"#;

async fn spawn_fixture() -> SocketAddr {
    let app = Router::new()
        .route("/data.json", get(|| async { JSON_BODY }))
        .route("/data.xml", get(|| async { XML_BODY }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn rest_row(source_id: i64, params: &str) -> RawSourceConfig {
    RawSourceConfig {
        source_id,
        kind: "rest".to_owned(),
        version: 1,
        params: toml::from_str(params).unwrap(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rest_sources_poll_decode_and_aggregate() {
    let fixture = spawn_fixture().await;

    let json_source = format!(
        r#"
        url = "http://{fixture}/data.json"
        poll_interval = 1

        [[result]]
        result_id = 1
        usage = "home-battery-power"
        mode = "json"
        path = "$.data.value"
        correction_factor = 10.0
        operator = "minus"
        "#
    );
    let xml_source = format!(
        r#"
        url = "http://{fixture}/data.xml"
        poll_interval = 1

        [[result]]
        result_id = 1
        usage = "grid-power"
        mode = "xml"
        path = "meter/reading"
        header_name = "Type"
        header_value = "GridPower"
        value_attribute = "Value"
        "#
    );

    let store = Arc::new(InMemorySourceStore::new(
        DecoderRegistry::with_defaults(),
        vec![rest_row(1, &json_source), rest_row(2, &xml_source)],
    ));
    let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(RestAdapter::new(store, 8))];
    let orchestrator = SourceOrchestrator::new(adapters, None);

    let report = orchestrator.recreate(&SourceFilter::all()).await;
    assert_eq!(report.added, 2);

    let tick = orchestrator.tick(Utc::now(), &CancellationToken::new()).await;
    assert_eq!(tick.refreshed, 2);
    assert_eq!(tick.failed, 0);

    let merged = orchestrator.aggregate(
        &[SourceUsage::GridPower, SourceUsage::HomeBatteryPower],
        true,
    );
    let grid = merged.get(&SourceUsage::GridPower).expect("grid readings");
    assert_eq!(grid.len(), 1);
    assert_eq!(grid[0].1, 18.7);
    let battery = merged
        .get(&SourceUsage::HomeBatteryPower)
        .expect("battery readings");
    assert_eq!(battery[0].1, -140.0);

    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rest_source_failure_keeps_its_last_good_value() {
    let fixture = spawn_fixture().await;
    let source = format!(
        r#"
        url = "http://{fixture}/data.json"
        poll_interval = 1
        timeout = 2

        [[result]]
        result_id = 1
        usage = "grid-power"
        mode = "json"
        path = "$.data.missing"
        "#
    );
    let store = Arc::new(InMemorySourceStore::new(
        DecoderRegistry::with_defaults(),
        vec![rest_row(3, &source)],
    ));
    let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(RestAdapter::new(store, 8))];
    let orchestrator = SourceOrchestrator::new(adapters, None);
    orchestrator.recreate(&SourceFilter::all()).await;

    let tick = orchestrator.tick(Utc::now(), &CancellationToken::new()).await;
    assert_eq!(tick.failed, 1);
    let merged = orchestrator.aggregate(&[SourceUsage::GridPower], true);
    assert!(merged.get(&SourceUsage::GridPower).is_none());

    orchestrator.shutdown().await;
}

// Mirrors the vendor frame: 28-byte header, then (id, 2 reserved, 2-byte
// length descriptor, value) records, terminated by a high identifier and
// padded to the 600-byte broadcast size.
fn meter_frame(supply_dw: u32, overage_dw: u32) -> Vec<u8> {
    let mut frame = vec![0u8; 28];
    for (id, value) in [(1u16, supply_dw), (2u16, overage_dw)] {
        frame.extend_from_slice(&id.to_be_bytes());
        frame.extend_from_slice(&[0, 0, 4, 0]);
        frame.extend_from_slice(&value.to_be_bytes());
    }
    frame.extend_from_slice(&0x9000u16.to_be_bytes());
    frame.resize(600, 0);
    frame
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn udp_meter_listener_folds_frames_into_grid_power() {
    // Bind ephemeral first so the sender knows the effective port and no
    // fixed port can clash with a concurrent test run.
    let listener = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();
    let config = SmaMeterConfig {
        port: 0,
        group: None,
        interface: Ipv4Addr::LOCALHOST,
        ..SmaMeterConfig::default()
    };
    let key = SourceKey::new(1, SourceKind::SmaEnergyMeter);
    let unit = SmaEnergyMeterAdapter::unit_on_socket(key, config, 8, listener);
    unit.activate();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // A runt datagram first: silently dropped, no error, no value.
    sender.send_to(&[0u8; 100], target).await.unwrap();
    // Then a complete frame: 400.0 W draw, 100.0 W feed-in.
    sender.send_to(&meter_frame(4000, 1000), target).await.unwrap();

    let value_key = ValueKey::new(SourceUsage::GridPower, 1);
    let mut latest = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        latest = unit.state().latest(&value_key);
        if latest.is_some() {
            break;
        }
    }
    let (_, grid) = latest.expect("meter frame produced a reading");
    assert_eq!(grid, -300.0);
    assert!(!unit.state().has_error());

    unit.dispose().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recreate_rebuilds_only_sources_present_in_the_store() {
    let fixture = spawn_fixture().await;
    let source = format!(
        r#"
        url = "http://{fixture}/data.json"
        poll_interval = 1

        [[result]]
        result_id = 1
        usage = "inverter-power"
        mode = "json"
        path = "$.data.value"
        "#
    );
    let store = Arc::new(InMemorySourceStore::new(
        DecoderRegistry::with_defaults(),
        vec![rest_row(1, &source), rest_row(2, &source)],
    ));
    let adapters: Vec<Arc<dyn SourceAdapter>> =
        vec![Arc::new(RestAdapter::new(store.clone(), 8))];
    let orchestrator = SourceOrchestrator::new(adapters, None);
    orchestrator.recreate(&SourceFilter::all()).await;
    assert_eq!(orchestrator.unit_count(), 2);

    // Drop source 2 from the store; the next full recreate removes its unit.
    store.replace_all(vec![rest_row(1, &source)]);
    let report = orchestrator.recreate(&SourceFilter::all()).await;
    assert_eq!(report.removed, 2);
    assert_eq!(report.added, 1);
    assert_eq!(orchestrator.unit_count(), 1);
    assert_eq!(
        orchestrator.unit_keys(),
        vec![SourceKey::new(1, SourceKind::Rest)]
    );

    orchestrator.shutdown().await;
}

#[test]
fn calibration_examples_from_the_field() {
    assert_eq!(
        helios_values::apply_correction(14.0, 10.0, Operator::Minus),
        -140.0
    );
    assert_eq!(
        helios_values::apply_correction(18.7, 1.0, Operator::Plus),
        18.7
    );
}

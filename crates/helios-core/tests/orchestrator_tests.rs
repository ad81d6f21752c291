//! ---
//! ems_section: "02-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use helios_core::{SourceAdapter, SourceFilter, SourceOrchestrator, SourceUnit};
use helios_values::{FetchFn, PolledSource, SourceKey, SourceKind, SourceUsage, ValueKey};
use tokio_util::sync::CancellationToken;

/// Adapter over fixed fetch closures, one per source id.
struct FnAdapter {
    kind: SourceKind,
    rows: Vec<(i64, Arc<FetchFn>)>,
}

impl FnAdapter {
    fn new(kind: SourceKind, rows: Vec<(i64, Arc<FetchFn>)>) -> Arc<Self> {
        Arc::new(Self { kind, rows })
    }
}

#[async_trait]
impl SourceAdapter for FnAdapter {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn build_units(&self, filter: &SourceFilter) -> Result<Vec<SourceUnit>> {
        Ok(self
            .rows
            .iter()
            .filter(|(id, _)| filter.matches_id(*id))
            .map(|(id, fetch)| {
                SourceUnit::from(PolledSource::new(
                    SourceKey::new(*id, self.kind),
                    Duration::from_millis(10),
                    4,
                    fetch.clone(),
                ))
            })
            .collect())
    }
}

fn value_fetch(value: f64) -> Arc<FetchFn> {
    Arc::new(move |_token| {
        Box::pin(async move {
            let mut values = HashMap::new();
            values.insert(ValueKey::new(SourceUsage::GridPower, 1), value);
            Ok(values)
        })
    })
}

fn failing_fetch(message: &'static str) -> Arc<FetchFn> {
    Arc::new(move |_token| Box::pin(async move { anyhow::bail!(message) }))
}

/// Succeeds until `fail_from` executions have happened, then fails.
fn flaky_fetch(fail_from: usize) -> Arc<FetchFn> {
    let executions = Arc::new(AtomicUsize::new(0));
    Arc::new(move |_token| {
        let executions = executions.clone();
        Box::pin(async move {
            let n = executions.fetch_add(1, Ordering::SeqCst);
            if n >= fail_from {
                anyhow::bail!("meter went away");
            }
            let mut values = HashMap::new();
            values.insert(ValueKey::new(SourceUsage::GridPower, 1), 230.0);
            Ok(values)
        })
    })
}

fn unit_by_key(orchestrator: &SourceOrchestrator, key: SourceKey) -> SourceUnit {
    orchestrator
        .units()
        .into_iter()
        .find(|unit| unit.key() == key)
        .expect("unit present")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tick_isolates_one_units_failure_from_the_rest() {
    let adapter = FnAdapter::new(
        SourceKind::Rest,
        vec![
            (1, value_fetch(120.0)),
            (2, failing_fetch("endpoint unreachable")),
        ],
    );
    let orchestrator = SourceOrchestrator::new(vec![adapter], None);
    orchestrator.recreate(&SourceFilter::all()).await;
    assert_eq!(orchestrator.unit_count(), 2);

    let report = orchestrator.tick(Utc::now(), &CancellationToken::new()).await;
    assert_eq!(report.due, 2);
    assert_eq!(report.refreshed, 1);
    assert_eq!(report.failed, 1);

    let healthy = unit_by_key(&orchestrator, SourceKey::new(1, SourceKind::Rest));
    let broken = unit_by_key(&orchestrator, SourceKey::new(2, SourceKind::Rest));
    assert!(!healthy.has_error());
    assert!(broken.has_error());

    let merged = orchestrator.aggregate(&[SourceUsage::GridPower], true);
    let readings = merged.get(&SourceUsage::GridPower).expect("grid readings");
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].1, 120.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recreate_with_filter_leaves_unrelated_units_untouched() {
    let modbus = FnAdapter::new(
        SourceKind::Modbus,
        vec![(5, value_fetch(1.0)), (6, value_fetch(2.0))],
    );
    let rest = FnAdapter::new(SourceKind::Rest, vec![(1, value_fetch(3.0))]);
    let orchestrator = SourceOrchestrator::new(vec![modbus, rest], None);
    orchestrator.recreate(&SourceFilter::all()).await;
    assert_eq!(orchestrator.unit_count(), 3);

    let old_target = unit_by_key(&orchestrator, SourceKey::new(5, SourceKind::Modbus));
    let old_sibling = unit_by_key(&orchestrator, SourceKey::new(6, SourceKind::Modbus));
    let old_rest = unit_by_key(&orchestrator, SourceKey::new(1, SourceKind::Rest));

    let report = orchestrator
        .recreate(&SourceFilter::for_sources(SourceKind::Modbus, vec![5]))
        .await;
    assert_eq!(report.removed, 1);
    assert_eq!(report.added, 1);
    assert_eq!(orchestrator.unit_count(), 3);

    // The reloaded source got a fresh unit; its old state is cancelled.
    let new_target = unit_by_key(&orchestrator, SourceKey::new(5, SourceKind::Modbus));
    assert!(!Arc::ptr_eq(old_target.state(), new_target.state()));
    assert!(old_target.state().token().is_cancelled());
    assert!(!new_target.state().token().is_cancelled());

    // Unrelated units are the very same instances and keep running.
    let sibling = unit_by_key(&orchestrator, SourceKey::new(6, SourceKind::Modbus));
    let rest_unit = unit_by_key(&orchestrator, SourceKey::new(1, SourceKind::Rest));
    assert!(Arc::ptr_eq(old_sibling.state(), sibling.state()));
    assert!(Arc::ptr_eq(old_rest.state(), rest_unit.state()));
    assert!(!sibling.state().token().is_cancelled());

    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn aggregate_skips_errored_units_despite_recent_values() {
    let adapter = FnAdapter::new(SourceKind::Rest, vec![(1, flaky_fetch(1))]);
    let orchestrator = SourceOrchestrator::new(vec![adapter], None);
    orchestrator.recreate(&SourceFilter::all()).await;

    let token = CancellationToken::new();
    let first = orchestrator.tick(Utc::now(), &token).await;
    assert_eq!(first.refreshed, 1);

    // Second execution fails; the buffered value from the first remains.
    let due_at = Utc::now() + chrono::Duration::seconds(1);
    let second = orchestrator.tick(due_at, &token).await;
    assert_eq!(second.failed, 1);

    let skipping = orchestrator.aggregate(&[SourceUsage::GridPower], true);
    assert!(skipping.get(&SourceUsage::GridPower).is_none());

    let including = orchestrator.aggregate(&[SourceUsage::GridPower], false);
    let readings = including.get(&SourceUsage::GridPower).expect("stale reading");
    assert_eq!(readings[0].1, 230.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_source_keys_from_adapters_are_not_registered_twice() {
    let first = FnAdapter::new(SourceKind::Modbus, vec![(5, value_fetch(1.0))]);
    let second = FnAdapter::new(SourceKind::Modbus, vec![(5, value_fetch(2.0))]);
    let orchestrator = SourceOrchestrator::new(vec![first, second], None);

    let report = orchestrator.recreate(&SourceFilter::all()).await;
    assert_eq!(report.added, 1);
    assert_eq!(orchestrator.unit_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_cancels_and_empties_the_live_set() {
    let adapter = FnAdapter::new(SourceKind::Rest, vec![(1, value_fetch(9.0))]);
    let orchestrator = SourceOrchestrator::new(vec![adapter], None);
    orchestrator.recreate(&SourceFilter::all()).await;
    let unit = unit_by_key(&orchestrator, SourceKey::new(1, SourceKind::Rest));

    orchestrator.shutdown().await;
    assert_eq!(orchestrator.unit_count(), 0);
    assert!(unit.state().token().is_cancelled());
}

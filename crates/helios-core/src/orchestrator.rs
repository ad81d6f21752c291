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
use std::sync::Arc;

use chrono::{DateTime, Utc};
use helios_metrics::EngineMetrics;
use helios_values::{RefreshOutcome, SourceUsage};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::SourceAdapter;
use crate::filter::SourceFilter;
use crate::unit::SourceUnit;

/// Outcome counts of one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Outcome counts of one hot-reconfiguration cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecreateReport {
    pub removed: usize,
    pub added: usize,
    pub dispose_failures: usize,
}

/// Owns the live set of acquisition units.
///
/// The set sits behind a mutex with short critical sections only; every
/// iterate/refresh path works off a snapshot copied under the lock so no
/// lock is held across network I/O or decoding.
pub struct SourceOrchestrator {
    units: Mutex<Vec<SourceUnit>>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    metrics: Option<EngineMetrics>,
}

impl std::fmt::Debug for SourceOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceOrchestrator")
            .field("units", &self.units.lock().len())
            .field("adapters", &self.adapters.len())
            .finish()
    }
}

impl SourceOrchestrator {
    pub fn new(adapters: Vec<Arc<dyn SourceAdapter>>, metrics: Option<EngineMetrics>) -> Self {
        Self {
            units: Mutex::new(Vec::new()),
            adapters,
            metrics,
        }
    }

    fn snapshot(&self) -> Vec<SourceUnit> {
        self.units.lock().clone()
    }

    /// Copy of the live set, taken under the lock. Callers iterate without
    /// blocking the tick loop or reconfiguration.
    pub fn units(&self) -> Vec<SourceUnit> {
        self.snapshot()
    }

    pub fn unit_count(&self) -> usize {
        self.units.lock().len()
    }

    pub fn unit_keys(&self) -> Vec<helios_values::SourceKey> {
        self.units.lock().iter().map(SourceUnit::key).collect()
    }

    /// Refresh every due pull unit concurrently. One unit's failure never
    /// cancels its siblings; failures are recorded on the unit and counted.
    pub async fn tick(&self, now: DateTime<Utc>, token: &CancellationToken) -> TickReport {
        let due: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter_map(|unit| unit.as_polled().cloned())
            .filter(|unit| unit.is_due(now))
            .collect();

        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };

        let results =
            futures::future::join_all(due.iter().map(|unit| unit.refresh_once(now, token))).await;

        for (unit, result) in due.iter().zip(results) {
            let kind = unit.key().kind.to_string();
            match result {
                Ok(RefreshOutcome::Refreshed(written)) => {
                    report.refreshed += 1;
                    debug!(source = %unit.key(), written, "source refreshed");
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_refresh(&kind);
                    }
                }
                Ok(RefreshOutcome::Skipped) => {
                    debug!(source = %unit.key(), "refresh already in flight; skipped");
                }
                Ok(RefreshOutcome::Cancelled) => {
                    report.cancelled += 1;
                    debug!(source = %unit.key(), "refresh cancelled");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(source = %unit.key(), error = %err, "source refresh failed");
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_refresh_failure(&kind);
                    }
                }
            }
        }
        report
    }

    /// Latest reading per unit for each requested usage. Units currently in
    /// error are excluded when `skip_errored` is set, even if they still
    /// hold a recent buffered value. The caller applies its own
    /// missing-data/summation policy; nothing is pre-summed here.
    pub fn aggregate(
        &self,
        usages: &[SourceUsage],
        skip_errored: bool,
    ) -> HashMap<SourceUsage, Vec<(DateTime<Utc>, f64)>> {
        let mut merged: HashMap<SourceUsage, Vec<(DateTime<Utc>, f64)>> = HashMap::new();
        for unit in self.snapshot() {
            if skip_errored && unit.has_error() {
                debug!(source = %unit.key(), "skipping errored source in aggregate");
                continue;
            }
            for (usage, at, value) in unit.state().latest_by_usage(usages) {
                merged.entry(usage).or_default().push((at, value));
            }
        }
        merged
    }

    /// Hot-reload the units matching the filter: cancel, drain in-flight
    /// work, dispose, remove, then rebuild from the registered adapters.
    /// Unrelated sources keep running and keep their history untouched.
    pub async fn recreate(&self, filter: &SourceFilter) -> RecreateReport {
        let selected: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|unit| filter.matches(&unit.key()))
            .collect();

        for unit in &selected {
            unit.cancel();
        }

        let mut report = RecreateReport::default();
        let mut disposed = Vec::new();
        for unit in &selected {
            match unit.dispose().await {
                Ok(()) => disposed.push(unit.key()),
                Err(err) => {
                    // Left registered so the leaked resource stays visible.
                    report.dispose_failures += 1;
                    error!(source = %unit.key(), error = %err, "dispose failed; unit left registered");
                }
            }
        }

        {
            let mut units = self.units.lock();
            units.retain(|unit| !disposed.contains(&unit.key()));
        }
        report.removed = disposed.len();

        for adapter in &self.adapters {
            if !filter.matches_kind(adapter.kind()) {
                continue;
            }
            let built = match adapter.build_units(filter).await {
                Ok(built) => built,
                Err(err) => {
                    error!(kind = %adapter.kind(), error = %err, "adapter rebuild failed");
                    continue;
                }
            };
            for unit in built {
                let key = unit.key();
                {
                    let mut units = self.units.lock();
                    if units.iter().any(|existing| existing.key() == key) {
                        warn!(source = %key, "unit for source key already live; skipping rebuild");
                        continue;
                    }
                    units.push(unit.clone());
                }
                unit.activate();
                report.added += 1;
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.inc_recreate();
            metrics.set_live_units(self.unit_count());
        }
        info!(
            removed = report.removed,
            added = report.added,
            dispose_failures = report.dispose_failures,
            "source set recreated"
        );
        report
    }

    /// Cancel and drain every unit without rebuilding. Used at daemon
    /// shutdown.
    pub async fn shutdown(&self) {
        let all = {
            let mut units = self.units.lock();
            std::mem::take(&mut *units)
        };
        for unit in &all {
            unit.cancel();
        }
        for unit in &all {
            if let Err(err) = unit.dispose().await {
                warn!(source = %unit.key(), error = %err, "dispose failed during shutdown");
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_live_units(0);
        }
        info!(disposed = all.len(), "orchestrator shutdown complete");
    }
}

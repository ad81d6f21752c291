//! ---
//! ems_section: "01-value-engine"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared per-source state: buffers, error triple, cancellation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::history::HistoricValues;
use crate::keys::{SourceKey, SourceUsage, ValueKey};

/// Error triple carried by every unit: message, detail (usually the debug
/// chain of the underlying error), and the instant the error was first seen.
///
/// `since` is stamped only on the transition from no-error to error and is
/// cleared together with the message.
#[derive(Debug, Clone, Default)]
pub struct ErrorState {
    message: Option<String>,
    detail: Option<String>,
    since: Option<DateTime<Utc>>,
}

impl ErrorState {
    pub fn has_error(&self) -> bool {
        self.message.is_some()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.since
    }

    fn record(&mut self, message: String, detail: Option<String>, now: DateTime<Utc>) {
        if self.message.is_none() {
            self.since = Some(now);
        }
        self.message = Some(message);
        self.detail = detail;
    }

    fn clear(&mut self) {
        self.message = None;
        self.detail = None;
        self.since = None;
    }
}

/// State shared between a refresh unit and the orchestration service: the
/// per-value-key history buffers, the error triple, and the unit's own
/// cancellation token. All mutation goes through the internal locks so a
/// listener task and an aggregation snapshot never race.
#[derive(Debug)]
pub struct SourceState {
    key: SourceKey,
    capacity: usize,
    buffers: Mutex<HashMap<ValueKey, HistoricValues<f64>>>,
    error: Mutex<ErrorState>,
    cancel: CancellationToken,
}

impl SourceState {
    pub fn new(key: SourceKey, capacity: usize) -> Self {
        Self {
            key,
            capacity: capacity.max(1),
            buffers: Mutex::new(HashMap::new()),
            error: Mutex::new(ErrorState::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn key(&self) -> SourceKey {
        self.key
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Idempotent; signals the unit token without blocking.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn update_value(&self, key: ValueKey, at: DateTime<Utc>, value: f64) {
        let mut buffers = self.buffers.lock();
        buffers
            .entry(key)
            .or_insert_with(|| HistoricValues::new(self.capacity))
            .update(at, value);
    }

    pub fn latest(&self, key: &ValueKey) -> Option<(DateTime<Utc>, f64)> {
        self.buffers.lock().get(key).and_then(HistoricValues::latest)
    }

    /// Latest reading of every buffer whose key carries one of the requested
    /// meter usages. Vehicle-tagged keys are never part of a meter aggregate.
    pub fn latest_by_usage(&self, usages: &[SourceUsage]) -> Vec<(SourceUsage, DateTime<Utc>, f64)> {
        let buffers = self.buffers.lock();
        let mut readings = Vec::new();
        for (key, buffer) in buffers.iter() {
            let Some(usage) = key.usage.as_source() else {
                continue;
            };
            if !usages.contains(&usage) {
                continue;
            }
            if let Some((at, value)) = buffer.latest() {
                readings.push((usage, at, value));
            }
        }
        readings
    }

    pub fn value_keys(&self) -> Vec<ValueKey> {
        self.buffers.lock().keys().copied().collect()
    }

    pub fn record_error(&self, message: impl Into<String>, detail: Option<String>) {
        self.error
            .lock()
            .record(message.into(), detail, Utc::now());
    }

    pub fn clear_error(&self) {
        self.error.lock().clear();
    }

    pub fn has_error(&self) -> bool {
        self.error.lock().has_error()
    }

    pub fn error_snapshot(&self) -> ErrorState {
        self.error.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SourceKind;

    fn state() -> SourceState {
        SourceState::new(SourceKey::new(1, SourceKind::Rest), 4)
    }

    #[test]
    fn has_error_follows_the_message() {
        let state = state();
        assert!(!state.has_error());
        state.record_error("boom", None);
        assert!(state.has_error());
        state.clear_error();
        assert!(!state.has_error());
    }

    #[test]
    fn since_is_stamped_once_per_error_episode() {
        let state = state();
        state.record_error("first", None);
        let first_seen = state.error_snapshot().since();
        assert!(first_seen.is_some());

        state.record_error("second", Some("detail".into()));
        let snapshot = state.error_snapshot();
        assert_eq!(snapshot.since(), first_seen);
        assert_eq!(snapshot.message(), Some("second"));

        state.clear_error();
        assert!(state.error_snapshot().since().is_none());

        state.record_error("third", None);
        assert_ne!(state.error_snapshot().since(), None);
    }

    #[test]
    fn latest_by_usage_filters_meter_usages() {
        let state = state();
        let now = Utc::now();
        state.update_value(ValueKey::new(SourceUsage::GridPower, 1), now, 100.0);
        state.update_value(ValueKey::new(SourceUsage::InverterPower, 2), now, 50.0);
        state.update_value(
            ValueKey::new(crate::keys::VehicleUsage::StateOfCharge, 3),
            now,
            80.0,
        );

        let readings = state.latest_by_usage(&[SourceUsage::GridPower]);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].0, SourceUsage::GridPower);
        assert_eq!(readings[0].2, 100.0);
    }
}

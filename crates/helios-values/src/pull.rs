//! ---
//! ems_section: "01-value-engine"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Periodic single-flight polling unit."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::keys::{SourceKey, ValueKey};
use crate::state::SourceState;

/// Caller-supplied async fetch. The token passed in fires when either the
/// unit or the surrounding tick/recreate is cancelled; implementations must
/// tear down partially-open connections when it does.
pub type FetchFn = dyn Fn(CancellationToken) -> BoxFuture<'static, Result<HashMap<ValueKey, f64>>>
    + Send
    + Sync;

/// Result of one `refresh_once` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The fetch ran and this many value keys were written.
    Refreshed(usize),
    /// An execution was already in flight; nothing was started.
    Skipped,
    /// The unit or caller token fired before the fetch completed.
    Cancelled,
}

/// Periodic polling unit wrapping an async fetch closure.
///
/// A one-permit semaphore guards the execution: a slow fetch is never started
/// twice concurrently, and a tick that finds the unit busy skips it instead
/// of queueing.
pub struct PolledSource {
    state: Arc<SourceState>,
    interval: Duration,
    next_execution_at: Mutex<DateTime<Utc>>,
    gate: Semaphore,
    fetch: Arc<FetchFn>,
}

impl std::fmt::Debug for PolledSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolledSource")
            .field("key", &self.state.key())
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl PolledSource {
    pub fn new(
        key: SourceKey,
        interval: Duration,
        capacity: usize,
        fetch: Arc<FetchFn>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(SourceState::new(key, capacity)),
            interval,
            // Due immediately: the first tick after (re)construction polls.
            next_execution_at: Mutex::new(Utc::now()),
            gate: Semaphore::new(1),
            fetch,
        })
    }

    pub fn key(&self) -> SourceKey {
        self.state.key()
    }

    pub fn state(&self) -> &Arc<SourceState> {
        &self.state
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_execution_at(&self) -> DateTime<Utc> {
        *self.next_execution_at.lock()
    }

    pub fn is_executing(&self) -> bool {
        self.gate.available_permits() == 0
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_executing() && now >= self.next_execution_at()
    }

    /// Run the fetch closure once, unless an execution is already in flight.
    ///
    /// The schedule advances to `now + interval` and the gate is released on
    /// every exit path. Success writes all returned readings at `now` and
    /// clears the error state; failure records the error and propagates it;
    /// cancellation is reported as an outcome, never as a unit error.
    pub async fn refresh_once(
        &self,
        now: DateTime<Utc>,
        external: &CancellationToken,
    ) -> Result<RefreshOutcome> {
        let Ok(_permit) = self.gate.try_acquire() else {
            return Ok(RefreshOutcome::Skipped);
        };
        *self.next_execution_at.lock() = now + self.interval;

        let run_token = self.state.token().child_token();
        let fetch = (self.fetch)(run_token.clone());
        tokio::pin!(fetch);

        let fetched = tokio::select! {
            result = &mut fetch => Some(result),
            _ = external.cancelled() => None,
            _ = self.state.token().cancelled() => None,
        };

        match fetched {
            Some(Ok(values)) => {
                let written = values.len();
                for (key, value) in values {
                    self.state.update_value(key, now, value);
                }
                self.state.clear_error();
                Ok(RefreshOutcome::Refreshed(written))
            }
            Some(Err(err)) => {
                self.state
                    .record_error(err.to_string(), Some(format!("{err:?}")));
                Err(err)
            }
            None => {
                // Dropping the pinned fetch future closes whatever connection
                // it held; the token lets cooperative closures exit early.
                run_token.cancel();
                debug!(source = %self.state.key(), "refresh cancelled");
                Ok(RefreshOutcome::Cancelled)
            }
        }
    }

    /// Idempotent; signals the unit token without blocking.
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Cancel and wait for any in-flight execution to release the gate.
    /// Guarantees no orphaned fetch keeps writing into a discarded buffer.
    pub async fn dispose(&self) {
        self.state.cancel();
        let _drained = self.gate.acquire().await;
    }
}

//! ---
//! ems_section: "01-value-engine"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Long-running push/listening unit."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::keys::SourceKey;
use crate::state::SourceState;

/// Listener body owning a persistent connection or socket. It must exit
/// promptly once the token fires; socket teardown racing the cancellation is
/// expected and treated as a normal shutdown, not an error.
pub type ListenFn = dyn Fn(Arc<SourceState>, CancellationToken) -> BoxFuture<'static, Result<()>>
    + Send
    + Sync;

/// Continuous unit that updates values as messages arrive (MQTT callback,
/// UDP datagram loop). One dedicated background task per unit.
pub struct ListeningSource {
    state: Arc<SourceState>,
    listen: Arc<ListenFn>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ListeningSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListeningSource")
            .field("key", &self.state.key())
            .finish_non_exhaustive()
    }
}

impl ListeningSource {
    pub fn new(key: SourceKey, capacity: usize, listen: Arc<ListenFn>) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(SourceState::new(key, capacity)),
            listen,
            task: Mutex::new(None),
        })
    }

    pub fn key(&self) -> SourceKey {
        self.state.key()
    }

    pub fn state(&self) -> &Arc<SourceState> {
        &self.state
    }

    pub fn is_listening(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Spawn the listener task. A second call while the task is alive is a
    /// no-op; a unit whose task already exited may be restarted.
    pub fn start_listener(&self) {
        let mut slot = self.task.lock();
        if slot.as_ref().map(|task| !task.is_finished()).unwrap_or(false) {
            return;
        }
        let state = self.state.clone();
        let listen = self.listen.clone();
        let token = state.token().clone();
        *slot = Some(tokio::spawn(async move {
            let key = state.key();
            match (listen)(state.clone(), token.clone()).await {
                Ok(()) => debug!(source = %key, "listener exited"),
                Err(err) if token.is_cancelled() => {
                    // Socket-closed/cancellation noise during shutdown is the
                    // expected way out of a blocking receive.
                    debug!(source = %key, error = %err, "listener closed during shutdown");
                }
                Err(err) => {
                    state.record_error(err.to_string(), Some(format!("{err:?}")));
                    error!(source = %key, error = %err, "listener failed");
                }
            }
        }));
    }

    /// Fire-and-forget shutdown: signal the token and return. The loop
    /// self-terminates on its next inbound wait.
    pub fn stop_listener(&self) {
        self.state.cancel();
    }

    /// Idempotent; signals the unit token without blocking.
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Cancel, then await the listener task so nothing keeps writing into a
    /// buffer that is about to be discarded. Join failures (listener panic)
    /// are surfaced to the caller.
    pub async fn dispose(&self) -> Result<()> {
        self.state.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await
                .map_err(|err| anyhow::anyhow!("listener task join failed: {err}"))?;
        }
        Ok(())
    }
}

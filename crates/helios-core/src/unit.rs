//! ---
//! ems_section: "02-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Uniform handle over pull and push units."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::Result;
use helios_values::{ListeningSource, PolledSource, SourceKey, SourceState};

/// Uniform handle the orchestrator keeps in its live set. Cloning is cheap;
/// both variants are reference-counted.
#[derive(Debug, Clone)]
pub enum SourceUnit {
    Polled(Arc<PolledSource>),
    Listening(Arc<ListeningSource>),
}

impl SourceUnit {
    pub fn key(&self) -> SourceKey {
        match self {
            SourceUnit::Polled(unit) => unit.key(),
            SourceUnit::Listening(unit) => unit.key(),
        }
    }

    pub fn state(&self) -> &Arc<SourceState> {
        match self {
            SourceUnit::Polled(unit) => unit.state(),
            SourceUnit::Listening(unit) => unit.state(),
        }
    }

    pub fn has_error(&self) -> bool {
        self.state().has_error()
    }

    pub fn as_polled(&self) -> Option<&Arc<PolledSource>> {
        match self {
            SourceUnit::Polled(unit) => Some(unit),
            SourceUnit::Listening(_) => None,
        }
    }

    /// Bring a freshly built unit to life. Pull units are due on the next
    /// tick; push units need their listener task spawned.
    pub fn activate(&self) {
        if let SourceUnit::Listening(unit) = self {
            unit.start_listener();
        }
    }

    pub fn cancel(&self) {
        match self {
            SourceUnit::Polled(unit) => unit.cancel(),
            SourceUnit::Listening(unit) => unit.cancel(),
        }
    }

    /// Cancel and drain in-flight work. Pull units cannot fail here; push
    /// units surface a listener join failure.
    pub async fn dispose(&self) -> Result<()> {
        match self {
            SourceUnit::Polled(unit) => {
                unit.dispose().await;
                Ok(())
            }
            SourceUnit::Listening(unit) => unit.dispose().await,
        }
    }
}

impl From<Arc<PolledSource>> for SourceUnit {
    fn from(unit: Arc<PolledSource>) -> Self {
        SourceUnit::Polled(unit)
    }
}

impl From<Arc<ListeningSource>> for SourceUnit {
    fn from(unit: Arc<ListeningSource>) -> Self {
        SourceUnit::Listening(unit)
    }
}

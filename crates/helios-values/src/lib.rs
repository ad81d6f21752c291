//! ---
//! ems_section: "01-value-engine"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Generic value acquisition primitives."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Core value acquisition primitives for the Helios engine.
//! This crate exposes the bounded historic buffer, the key model that
//! disambiguates readings, the shared per-source state, and the two
//! scheduling disciplines (pull-based refresh, push-based listening).

pub mod calc;
pub mod history;
pub mod keys;
pub mod pull;
pub mod push;
pub mod state;

pub use calc::{apply_correction, Operator};
pub use history::HistoricValues;
pub use keys::{SourceKey, SourceKind, SourceUsage, ValueKey, ValueUsage, VehicleUsage};
pub use pull::{FetchFn, PolledSource, RefreshOutcome};
pub use push::{ListenFn, ListeningSource};
pub use state::{ErrorState, SourceState};

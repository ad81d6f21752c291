//! ---
//! ems_section: "02-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Handling service for the Helios acquisition engine: owns the live set of
//! pull and push units, ticks due units, aggregates readings per usage, and
//! performs safe hot-reconfiguration without stopping unrelated sources.

pub mod adapter;
pub mod filter;
pub mod orchestrator;
pub mod unit;

pub use adapter::SourceAdapter;
pub use filter::SourceFilter;
pub use orchestrator::{RecreateReport, SourceOrchestrator, TickReport};
pub use unit::SourceUnit;

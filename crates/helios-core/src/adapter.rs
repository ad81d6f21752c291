//! ---
//! ems_section: "02-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Seam between persisted configuration and live units."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
use async_trait::async_trait;
use helios_values::SourceKind;

use crate::filter::SourceFilter;
use crate::unit::SourceUnit;

/// One adapter per vendor/protocol. An adapter is a pure translation from
/// configuration rows to units; the closures it builds capture only value
/// types, never mutable state shared across adapters.
///
/// Rows that fail to construct a unit (missing fields, undecodable blobs)
/// are logged by the adapter and skipped for the cycle; an `Err` from
/// `build_units` means the row store itself was unreachable.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn build_units(&self, filter: &SourceFilter) -> Result<Vec<SourceUnit>>;
}

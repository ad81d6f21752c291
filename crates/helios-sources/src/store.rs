//! ---
//! ems_section: "03-protocol-adapters"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Predicate-based configuration row store."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
use async_trait::async_trait;
use helios_common::RawSourceConfig;
use helios_core::SourceFilter;
use helios_values::{SourceKey, SourceKind};
use parking_lot::RwLock;
use tracing::warn;

use crate::registry::{DecoderRegistry, SourceRow};

/// One decoded row together with the source key it will own.
#[derive(Debug, Clone)]
pub struct DecodedSource {
    pub key: SourceKey,
    pub row: SourceRow,
}

/// Predicate-based fetch of configuration rows. Backed by a relational
/// store in production; the engine only ever reads through this seam.
#[async_trait]
pub trait SourceConfigStore: Send + Sync {
    /// Decoded rows matching the filter. Rows that fail to decode are
    /// logged and skipped; an `Err` means the store itself was unreachable.
    async fn sources(&self, filter: &SourceFilter) -> Result<Vec<DecodedSource>>;
}

/// Store over raw rows held in memory, decoded on read through the
/// registry. `replace_all` swaps the whole row set; callers follow up with
/// a `recreate` to make the new rows live.
pub struct InMemorySourceStore {
    registry: DecoderRegistry,
    rows: RwLock<Vec<RawSourceConfig>>,
}

impl InMemorySourceStore {
    pub fn new(registry: DecoderRegistry, rows: Vec<RawSourceConfig>) -> Self {
        Self {
            registry,
            rows: RwLock::new(rows),
        }
    }

    pub fn replace_all(&self, rows: Vec<RawSourceConfig>) {
        *self.rows.write() = rows;
    }

    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }
}

#[async_trait]
impl SourceConfigStore for InMemorySourceStore {
    async fn sources(&self, filter: &SourceFilter) -> Result<Vec<DecodedSource>> {
        let rows = self.rows.read().clone();
        let mut decoded = Vec::new();
        for raw in &rows {
            let Ok(kind) = raw.kind.parse::<SourceKind>() else {
                warn!(source_id = raw.source_id, kind = %raw.kind, "unknown source kind; row skipped");
                continue;
            };
            let key = SourceKey::new(raw.source_id, kind);
            if !filter.matches(&key) {
                continue;
            }
            match self.registry.decode(raw) {
                Ok(row) => decoded.push(DecodedSource { key, row }),
                Err(err) => {
                    // The row stays broken until it is fixed externally and
                    // a recreate runs again; no unit is built for it.
                    warn!(source = %key, error = %format!("{err:#}"), "undecodable source row skipped");
                }
            }
        }
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(source_id: i64, kind: &str, params: &str) -> RawSourceConfig {
        RawSourceConfig {
            source_id,
            kind: kind.to_owned(),
            version: 1,
            params: toml::from_str(params).unwrap(),
        }
    }

    fn store() -> InMemorySourceStore {
        InMemorySourceStore::new(
            DecoderRegistry::with_defaults(),
            vec![
                raw(1, "rest", "url = \"http://meter.local/data\""),
                raw(5, "modbus", "host = \"10.0.0.20\""),
                raw(6, "modbus", "port = 502"), // missing host, undecodable
                raw(7, "sma-energy-meter", ""),
            ],
        )
    }

    #[tokio::test]
    async fn filter_restricts_rows_by_kind_and_id() {
        let store = store();
        let rows = store
            .sources(&SourceFilter::for_kind(SourceKind::Modbus))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, SourceKey::new(5, SourceKind::Modbus));
    }

    #[tokio::test]
    async fn undecodable_rows_are_skipped_not_fatal() {
        let store = store();
        let rows = store.sources(&SourceFilter::all()).await.unwrap();
        let ids: Vec<i64> = rows.iter().map(|row| row.key.source_id).collect();
        assert_eq!(ids, vec![1, 5, 7]);
    }

    #[tokio::test]
    async fn replace_all_swaps_the_row_set() {
        let store = store();
        store.replace_all(vec![raw(2, "rest", "url = \"http://other.local\"")]);
        let rows = store.sources(&SourceFilter::all()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key.source_id, 2);
    }
}

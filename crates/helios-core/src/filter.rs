//! ---
//! ems_section: "02-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Selection predicate for units and configuration rows."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use helios_values::{SourceKey, SourceKind};

/// Restricts orchestration operations to a protocol family and/or a set of
/// source ids. The empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceFilter {
    pub kind: Option<SourceKind>,
    pub ids: Option<Vec<i64>>,
}

impl SourceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_kind(kind: SourceKind) -> Self {
        Self {
            kind: Some(kind),
            ids: None,
        }
    }

    pub fn for_sources(kind: SourceKind, ids: Vec<i64>) -> Self {
        Self {
            kind: Some(kind),
            ids: Some(ids),
        }
    }

    pub fn matches_kind(&self, kind: SourceKind) -> bool {
        self.kind.map(|wanted| wanted == kind).unwrap_or(true)
    }

    pub fn matches_id(&self, id: i64) -> bool {
        self.ids
            .as_ref()
            .map(|ids| ids.contains(&id))
            .unwrap_or(true)
    }

    pub fn matches(&self, key: &SourceKey) -> bool {
        self.matches_kind(key.kind) && self.matches_id(key.source_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_matches_everything() {
        let filter = SourceFilter::all();
        assert!(filter.matches(&SourceKey::new(1, SourceKind::Rest)));
        assert!(filter.matches(&SourceKey::new(99, SourceKind::Modbus)));
    }

    #[test]
    fn kind_and_id_restrict_independently() {
        let filter = SourceFilter::for_sources(SourceKind::Modbus, vec![5]);
        assert!(filter.matches(&SourceKey::new(5, SourceKind::Modbus)));
        assert!(!filter.matches(&SourceKey::new(5, SourceKind::Rest)));
        assert!(!filter.matches(&SourceKey::new(6, SourceKind::Modbus)));
    }
}

//! ---
//! ems_section: "01-value-engine"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bounded append-and-evict history buffer."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::VecDeque;

use chrono::{DateTime, Utc};

/// Fixed-capacity sequence of timestamped readings for one logical quantity.
///
/// Appending beyond capacity evicts the oldest entry first. Capacity is
/// clamped to at least one so a buffer can always hold a freshest value.
#[derive(Debug, Clone)]
pub struct HistoricValues<T> {
    capacity: usize,
    entries: VecDeque<(DateTime<Utc>, T)>,
}

impl<T: Copy> HistoricValues<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a reading, evicting the oldest entry when full.
    pub fn update(&mut self, at: DateTime<Utc>, value: T) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((at, value));
    }

    /// Most recent reading, or `None` when nothing was recorded yet.
    pub fn latest(&self) -> Option<(DateTime<Utc>, T)> {
        self.entries.back().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(DateTime<Utc>, T)> {
        self.entries.iter()
    }
}

//! Per-domain table of supported frequencies.

use alloc::vec::Vec;
use itertools::Itertools;
use snafu::{ensure, Snafu};

use super::{Khz, Relation};

/// Errors building a frequency table.
#[derive(Debug, Snafu)]
pub enum TableError {
    /// No table entry survived the capability-bound filter.
    #[snafu(display("no frequency between {min} and {max} kHz in table"))]
    Empty {
        /// Lower capability bound applied to the raw table.
        min: Khz,
        /// Upper capability bound applied to the raw table.
        max: Khz,
    },
}

/// Ordered set of the frequencies a domain supports, highest first.
///
/// Built once from the raw device-tree list at domain init and immutable
/// afterwards. Entries outside the domain's hardware capability bounds are
/// dropped during construction.
#[derive(Debug, Clone)]
pub struct FrequencyTable {
    entries: Vec<Khz>,
}

impl FrequencyTable {
    /// Build a table from a raw frequency list, keeping only entries within
    /// `[min, max]`, sorted descending with duplicates removed.
    ///
    /// # Errors
    /// Returns [`TableError::Empty`] if nothing survives the filter.
    pub fn new(raw: &[Khz], min: Khz, max: Khz) -> Result<Self, TableError> {
        let entries: Vec<Khz> = raw
            .iter()
            .copied()
            .filter(|f| (min..=max).contains(f))
            .sorted_unstable_by(|a, b| b.cmp(a))
            .dedup()
            .collect();
        ensure!(!entries.is_empty(), EmptySnafu { min, max });
        Ok(FrequencyTable { entries })
    }

    /// Resolve `target` to a table entry according to `relation`.
    ///
    /// Returns `None` when no entry satisfies the relation (target below the
    /// table floor for [`Relation::Highest`], above the ceiling for
    /// [`Relation::Lowest`]).
    #[must_use]
    pub fn resolve(&self, target: Khz, relation: Relation) -> Option<Khz> {
        match relation {
            Relation::Highest => self.entries.iter().copied().find(|&f| f <= target),
            Relation::Lowest => self.entries.iter().rev().copied().find(|&f| f >= target),
        }
    }

    /// Highest entry not exceeding `raw`, or the table floor when `raw` is
    /// below every entry. Used to snap externally supplied constraint data
    /// onto the actually-available frequencies.
    #[must_use]
    pub fn snap_down(&self, raw: Khz) -> Khz {
        self.resolve(raw, Relation::Highest)
            .unwrap_or_else(|| self.lowest())
    }

    /// Position of an exact entry, index 0 being the highest frequency.
    #[must_use]
    pub fn position(&self, freq: Khz) -> Option<usize> {
        self.entries.iter().position(|&f| f == freq)
    }

    /// Entry at `index`, if in range.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Khz> {
        self.entries.get(index).copied()
    }

    /// Highest supported frequency.
    #[must_use]
    pub fn highest(&self) -> Khz {
        self.entries[0]
    }

    /// Lowest supported frequency.
    #[must_use]
    pub fn lowest(&self) -> Khz {
        self.entries[self.entries.len() - 1]
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries. Construction guarantees `false`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `freq` is an exact table entry.
    #[must_use]
    pub fn contains(&self, freq: Khz) -> bool {
        self.position(freq).is_some()
    }

    /// Iterate over the entries, highest first.
    pub fn iter(&self) -> impl Iterator<Item = Khz> + '_ {
        self.entries.iter().copied()
    }
}

//! Per-cluster throttling statistics.

use alloc::vec;
use alloc::vec::Vec;

use crate::freq::{FrequencyTable, Khz};

/// Time-in-state bookkeeping for one AFM cluster's ceiling.
///
/// Indexed by the cluster's frequency table; accumulates how long each
/// ceiling was in effect and how many ceiling changes happened.
#[derive(Debug)]
pub struct AfmStats {
    freqs: Vec<Khz>,
    time_in_state_ms: Vec<u64>,
    last_index: usize,
    last_time_ms: u64,
    total_trans: u32,
}

impl AfmStats {
    /// Start accounting with the ceiling at the table's highest entry.
    pub fn new(table: &FrequencyTable, now_ms: u64) -> Self {
        AfmStats {
            freqs: table.iter().collect(),
            time_in_state_ms: vec![0; table.len()],
            last_index: 0,
            last_time_ms: now_ms,
            total_trans: 0,
        }
    }

    fn account(&mut self, now_ms: u64) {
        self.time_in_state_ms[self.last_index] += now_ms.saturating_sub(self.last_time_ms);
        self.last_time_ms = now_ms;
    }

    /// Record the ceiling moving to `freq`.
    ///
    /// An off-table frequency only closes the previous interval.
    pub fn transition(&mut self, freq: Khz, now_ms: u64) {
        self.account(now_ms);
        if let Some(index) = self.freqs.iter().position(|&f| f == freq) {
            if index != self.last_index {
                self.last_index = index;
                self.total_trans += 1;
            }
        }
    }

    /// Accumulated `(frequency, milliseconds)` rows, highest first, with the
    /// currently open interval closed at `now_ms`.
    pub fn time_in_state(&mut self, now_ms: u64) -> Vec<(Khz, u64)> {
        self.account(now_ms);
        self.freqs
            .iter()
            .copied()
            .zip(self.time_in_state_ms.iter().copied())
            .collect()
    }

    /// Number of ceiling changes so far.
    pub fn total_trans(&self) -> u32 {
        self.total_trans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> FrequencyTable {
        FrequencyTable::new(&[1000, 800, 600], 0, Khz::MAX).expect("build table")
    }

    #[test]
    fn accumulates_per_ceiling() {
        let mut stats = AfmStats::new(&table(), 100);
        stats.transition(800, 150); // 50ms at 1000
        stats.transition(600, 175); // 25ms at 800
        stats.transition(1000, 275); // 100ms at 600

        assert_eq!(stats.total_trans(), 3);
        assert_eq!(
            stats.time_in_state(300),
            vec![(1000, 50 + 25), (800, 25), (600, 100)]
        );
    }

    #[test]
    fn same_ceiling_is_not_a_transition() {
        let mut stats = AfmStats::new(&table(), 0);
        stats.transition(1000, 10);
        stats.transition(1000, 20);
        assert_eq!(stats.total_trans(), 0);
        assert_eq!(stats.time_in_state(30)[0], (1000, 30));
    }
}

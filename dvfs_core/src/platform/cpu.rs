//! CPU identifiers and sibling masks.

/// A unique identifier for a single CPU core.
pub type CpuId = usize;

/// A set of CPU cores, stored as a bit mask.
///
/// Domains and AFM clusters use this for their sibling-cpus configuration
/// and for tracking which of those siblings are currently online.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuSet(u64);

impl CpuSet {
    /// The empty set.
    pub const EMPTY: CpuSet = CpuSet(0);

    /// Build a set from an explicit list of CPU ids.
    #[must_use]
    pub fn from_ids(ids: &[CpuId]) -> Self {
        let mut mask = 0u64;
        for id in ids {
            mask |= 1 << id;
        }
        CpuSet(mask)
    }

    /// Whether `cpu` is a member.
    #[must_use]
    pub fn contains(&self, cpu: CpuId) -> bool {
        cpu < u64::BITS as usize && self.0 & (1 << cpu) != 0
    }

    /// Insert `cpu` into the set.
    pub fn insert(&mut self, cpu: CpuId) {
        self.0 |= 1 << cpu;
    }

    /// Remove `cpu` from the set.
    pub fn remove(&mut self, cpu: CpuId) {
        self.0 &= !(1 << cpu);
    }

    /// Whether the set has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// The lowest-numbered member, if any.
    #[must_use]
    pub fn first(&self) -> Option<CpuId> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as CpuId)
        }
    }

    /// The members present in both sets.
    #[must_use]
    pub fn intersection(&self, other: &CpuSet) -> CpuSet {
        CpuSet(self.0 & other.0)
    }

    /// Iterate over the members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        let mask = self.0;
        (0..u64::BITS as usize).filter(move |cpu| mask & (1 << cpu) != 0)
    }
}

impl core::fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_and_first() {
        let mut set = CpuSet::from_ids(&[4, 5, 6, 7]);
        assert!(set.contains(4));
        assert!(!set.contains(3));
        assert_eq!(set.first(), Some(4));
        assert_eq!(set.len(), 4);

        set.remove(4);
        assert_eq!(set.first(), Some(5));
        set.remove(5);
        set.remove(6);
        set.remove(7);
        assert!(set.is_empty());
        assert_eq!(set.first(), None);
    }

    #[test]
    fn intersection() {
        let a = CpuSet::from_ids(&[0, 1, 2, 3]);
        let b = CpuSet::from_ids(&[2, 3, 4]);
        assert_eq!(a.intersection(&b), CpuSet::from_ids(&[2, 3]));
    }
}

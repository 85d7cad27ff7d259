//! Multi-domain constraint management.
//!
//! Domains whose performance depends on each other register here with a
//! scaler callback and per-pair constraint tables. A request routed through
//! [`DvfsManager::resolve_and_apply`] raises every dependent slave's floor
//! before the master's own transition starts, so the slaves are never
//! observed below the floor the master's new frequency requires.

use alloc::boxed::Box;
use alloc::vec::Vec;
use hashbrown::HashMap;
use itertools::Itertools;
use snafu::{ensure, OptionExt, ResultExt, Snafu};

#[cfg(test)]
use mockall::automock;

use crate::config::DomainId;
use crate::freq::{FrequencyTable, Khz, Relation, Window};
use crate::scaling::ScaleError;

/// One master-to-slave row: while the master runs at `master` kHz or below
/// (down to the next row), the slave must run at `slave` kHz or above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstraintRow {
    /// Master operating point.
    pub master: Khz,
    /// Slave floor required at that point.
    pub slave: Khz,
}

/// A master's floor requirements on one slave, keyed by master frequency in
/// descending order. Built once at probe, immutable afterwards.
#[derive(Debug, Clone)]
pub struct ConstraintTable {
    rows: Vec<ConstraintRow>,
}

impl ConstraintTable {
    /// Build from explicit device-tree `(master, slave)` pairs.
    ///
    /// Both sides are snapped down onto the respective frequency tables
    /// first. The result carries one row per master table entry; entries
    /// without a declared pair inherit the nearest declared row above them,
    /// the topmost declared row covering everything higher.
    pub fn from_pairs(
        pairs: &[(Khz, Khz)],
        master: &FrequencyTable,
        slave: &FrequencyTable,
    ) -> Self {
        let declared: HashMap<Khz, Khz> = pairs
            .iter()
            .map(|&(m, s)| (master.snap_down(m), slave.snap_down(s)))
            .collect();
        let top_slave = pairs
            .iter()
            .map(|&(m, s)| (master.snap_down(m), slave.snap_down(s)))
            .sorted_unstable_by(|a, b| b.0.cmp(&a.0))
            .map(|(_, s)| s)
            .next();
        Self::fill(master, |entry| declared.get(&entry).copied(), top_slave)
    }

    /// Build from calibration data rows, which are keyed by exact master
    /// frequencies. Master entries above the first tabulated one inherit the
    /// top calibration row's slave value.
    pub fn from_calibration(rows: &[(Khz, Khz)], master: &FrequencyTable) -> Self {
        let declared: HashMap<Khz, Khz> = rows.iter().copied().collect();
        let top_slave = rows.first().map(|&(_, s)| s);
        Self::fill(master, |entry| declared.get(&entry).copied(), top_slave)
    }

    fn fill(
        master: &FrequencyTable,
        lookup: impl Fn(Khz) -> Option<Khz>,
        top_slave: Option<Khz>,
    ) -> Self {
        let Some(mut carry) = top_slave else {
            return ConstraintTable { rows: Vec::new() };
        };
        let rows = master
            .iter()
            .map(|entry| {
                if let Some(s) = lookup(entry) {
                    carry = s;
                }
                ConstraintRow {
                    master: entry,
                    slave: carry,
                }
            })
            .collect();
        ConstraintTable { rows }
    }

    /// The slave floor required while the master targets `target`.
    ///
    /// Selects the lowest row whose master key still covers the target; a
    /// target above every key lands on the top row.
    pub fn slave_floor_for(&self, target: Khz) -> Option<Khz> {
        self.rows
            .iter()
            .rev()
            .find(|row| row.master >= target)
            .or_else(|| self.rows.first())
            .map(|row| row.slave)
    }

    /// The rows, descending by master key.
    pub fn rows(&self) -> &[ConstraintRow] {
        &self.rows
    }

    /// Whether the table carries no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Callback surface one registered domain exposes to the manager.
#[cfg_attr(test, automock)]
pub trait DomainScaler: Send + Sync {
    /// The domain this scaler drives.
    fn domain_id(&self) -> DomainId;

    /// Raise or lower the floor the constraint manager owns on this domain.
    ///
    /// # Errors
    /// Propagates the domain's scaling errors.
    fn set_floor(&self, floor: Khz) -> Result<(), ScaleError>;

    /// Scale the domain to `target` under `relation`.
    ///
    /// # Errors
    /// Propagates the domain's scaling errors.
    fn scale_to(&self, target: Khz, relation: Relation) -> Result<Khz, ScaleError>;

    /// Frequency the domain currently runs at.
    fn current(&self) -> Khz;
}

/// Errors from constraint-manager operations.
#[derive(Debug, Snafu)]
pub enum DmError {
    /// The named domain never registered.
    #[snafu(display("domain {id} not registered with the constraint manager"))]
    UnknownDomain {
        /// The missing id.
        id: DomainId,
    },
    /// The named domain registered twice.
    #[snafu(display("domain {id} already registered with the constraint manager"))]
    DuplicateDomain {
        /// The repeated id.
        id: DomainId,
    },
    /// A registered constraint table has no rows.
    #[snafu(display("constraint {master} -> {slave} has no rows"))]
    EmptyConstraint {
        /// Master side.
        master: DomainId,
        /// Slave side.
        slave: DomainId,
    },
    /// Raising a slave's floor failed.
    #[snafu(display("raising floor of domain {slave} failed"))]
    SlaveFloor {
        /// The slave that refused.
        slave: DomainId,
        /// Underlying scaling failure.
        source: ScaleError,
    },
    /// The master's own transition failed.
    #[snafu(display("scaling master domain {master} failed"))]
    MasterScale {
        /// The failing master.
        master: DomainId,
        /// Underlying scaling failure.
        source: ScaleError,
    },
}

struct Constraint {
    slave: DomainId,
    table: ConstraintTable,
}

struct Participant {
    scaler: Box<dyn DomainScaler>,
    window: Option<Window>,
    constraints: Vec<Constraint>,
}

/// The constraint manager.
pub struct DvfsManager {
    participants: HashMap<DomainId, Participant>,
}

impl DvfsManager {
    /// An empty manager.
    pub fn new() -> Self {
        DvfsManager {
            participants: HashMap::new(),
        }
    }

    /// Register a domain with its scaler callback.
    ///
    /// # Errors
    /// [`DmError::DuplicateDomain`] when the id is already present.
    pub fn register_domain(&mut self, scaler: Box<dyn DomainScaler>) -> Result<(), DmError> {
        let id = scaler.domain_id();
        ensure!(
            !self.participants.contains_key(&id),
            DuplicateDomainSnafu { id }
        );
        self.participants.insert(
            id,
            Participant {
                scaler,
                window: None,
                constraints: Vec::new(),
            },
        );
        Ok(())
    }

    /// Register a constraint table between two registered domains.
    ///
    /// # Errors
    /// [`DmError::UnknownDomain`] for an unregistered side,
    /// [`DmError::EmptyConstraint`] for a rowless table.
    pub fn register_constraint(
        &mut self,
        master: DomainId,
        slave: DomainId,
        table: ConstraintTable,
    ) -> Result<(), DmError> {
        ensure!(!table.is_empty(), EmptyConstraintSnafu { master, slave });
        ensure!(
            self.participants.contains_key(&slave),
            UnknownDomainSnafu { id: slave }
        );
        let participant = self
            .participants
            .get_mut(&master)
            .context(UnknownDomainSnafu { id: master })?;
        participant.constraints.push(Constraint { slave, table });
        Ok(())
    }

    /// Record a domain's current policy window. Targets routed through
    /// [`resolve_and_apply`](Self::resolve_and_apply) are clamped into it.
    ///
    /// # Errors
    /// [`DmError::UnknownDomain`] when the domain never registered.
    pub fn policy_update(&mut self, domain: DomainId, window: Window) -> Result<(), DmError> {
        let participant = self
            .participants
            .get_mut(&domain)
            .context(UnknownDomainSnafu { id: domain })?;
        participant.window = Some(window);
        log::debug!(
            "dm: domain {domain} window {}..{} kHz",
            window.min,
            window.max
        );
        Ok(())
    }

    /// Whether the domain has any constraint tables mastered on it.
    pub fn has_constraints(&self, domain: DomainId) -> bool {
        self.participants
            .get(&domain)
            .is_some_and(|p| !p.constraints.is_empty())
    }

    /// Drive `master` toward `target`: clamp into the policy window, raise
    /// every slave's floor first, then scale the master itself. Returns the
    /// frequency the master runs at afterwards.
    ///
    /// A clamped target that still reaches the window ceiling resolves with
    /// [`Relation::Highest`], everything below with [`Relation::Lowest`], so
    /// the constraint floors stay conservative.
    ///
    /// # Errors
    /// See [`DmError`]. When a slave refuses its floor the master is left
    /// untouched.
    pub fn resolve_and_apply(&self, master: DomainId, target: Khz) -> Result<Khz, DmError> {
        let participant = self
            .participants
            .get(&master)
            .context(UnknownDomainSnafu { id: master })?;

        let clamped = match participant.window {
            Some(w) => target.clamp(w.min, w.max),
            None => target,
        };

        for constraint in &participant.constraints {
            let Some(floor) = constraint.table.slave_floor_for(clamped) else {
                continue;
            };
            let slave = self
                .participants
                .get(&constraint.slave)
                .context(UnknownDomainSnafu {
                    id: constraint.slave,
                })?;
            slave
                .scaler
                .set_floor(floor)
                .context(SlaveFloorSnafu {
                    slave: constraint.slave,
                })?;
            if slave.scaler.current() < floor {
                slave
                    .scaler
                    .scale_to(floor, Relation::Lowest)
                    .context(SlaveFloorSnafu {
                        slave: constraint.slave,
                    })?;
            }
        }

        let relation = match participant.window {
            Some(w) if clamped >= w.max => Relation::Highest,
            Some(_) => Relation::Lowest,
            None => Relation::Highest,
        };
        participant
            .scaler
            .scale_to(clamped, relation)
            .context(MasterScaleSnafu { master })
    }
}

impl Default for DvfsManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use mockall::Sequence;

    use super::*;

    fn table(entries: &[Khz]) -> FrequencyTable {
        FrequencyTable::new(entries, 0, Khz::MAX).expect("build table")
    }

    #[test]
    fn pairs_snap_and_carry_forward() {
        let master = table(&[2000, 1600, 1200, 800, 400]);
        let slave = table(&[1000, 800, 600, 400]);
        // raw pairs off-grid on both sides
        let t = ConstraintTable::from_pairs(&[(1700, 900), (900, 500)], &master, &slave);
        assert_eq!(
            t.rows(),
            &[
                // 2000 has no declared row, inherits the topmost declared one
                ConstraintRow { master: 2000, slave: 800 },
                ConstraintRow { master: 1600, slave: 800 },
                ConstraintRow { master: 1200, slave: 800 },
                ConstraintRow { master: 800, slave: 400 },
                ConstraintRow { master: 400, slave: 400 },
            ]
        );
    }

    #[test]
    fn calibration_rows_match_exactly() {
        let master = table(&[2000, 1600, 1200, 800]);
        let t = ConstraintTable::from_calibration(&[(1600, 900), (800, 500)], &master);
        assert_eq!(
            t.rows(),
            &[
                ConstraintRow { master: 2000, slave: 900 },
                ConstraintRow { master: 1600, slave: 900 },
                ConstraintRow { master: 1200, slave: 900 },
                ConstraintRow { master: 800, slave: 500 },
            ]
        );
    }

    #[test]
    fn floor_lookup_picks_lowest_covering_row() {
        let master = table(&[2000, 1600, 1200]);
        let t = ConstraintTable::from_calibration(
            &[(2000, 1000), (1600, 800), (1200, 600)],
            &master,
        );
        assert_eq!(t.slave_floor_for(1200), Some(600));
        assert_eq!(t.slave_floor_for(1300), Some(800));
        assert_eq!(t.slave_floor_for(1600), Some(800));
        assert_eq!(t.slave_floor_for(2000), Some(1000));
        // above every key: top row
        assert_eq!(t.slave_floor_for(2400), Some(1000));
    }

    fn slave_table() -> ConstraintTable {
        let master = table(&[2000, 1600, 1200]);
        ConstraintTable::from_calibration(&[(2000, 1000), (1600, 800), (1200, 600)], &master)
    }

    #[test]
    fn slave_floor_rises_before_master_scales() {
        let mut seq = Sequence::new();

        let mut slave = MockDomainScaler::new();
        slave.expect_domain_id().return_const(0usize);
        slave
            .expect_set_floor()
            .withf(|f| *f == 1000)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        slave.expect_current().return_const(600u32);
        slave
            .expect_scale_to()
            .withf(|t, r| *t == 1000 && *r == Relation::Lowest)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|t, _| Ok(t));

        let mut master = MockDomainScaler::new();
        master.expect_domain_id().return_const(1usize);
        master
            .expect_scale_to()
            .withf(|t, r| *t == 2000 && *r == Relation::Highest)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|t, _| Ok(t));

        let mut dm = DvfsManager::new();
        dm.register_domain(Box::new(slave)).unwrap();
        dm.register_domain(Box::new(master)).unwrap();
        dm.register_constraint(1, 0, slave_table()).unwrap();
        dm.policy_update(1, Window { min: 1200, max: 2000 }).unwrap();

        assert_eq!(dm.resolve_and_apply(1, 2400).unwrap(), 2000);
    }

    #[test]
    fn slave_already_above_floor_is_not_scaled() {
        let mut slave = MockDomainScaler::new();
        slave.expect_domain_id().return_const(0usize);
        slave
            .expect_set_floor()
            .withf(|f| *f == 600)
            .times(1)
            .returning(|_| Ok(()));
        slave.expect_current().return_const(800u32);

        let mut master = MockDomainScaler::new();
        master.expect_domain_id().return_const(1usize);
        master
            .expect_scale_to()
            .withf(|t, r| *t == 1200 && *r == Relation::Lowest)
            .times(1)
            .returning(|t, _| Ok(t));

        let mut dm = DvfsManager::new();
        dm.register_domain(Box::new(slave)).unwrap();
        dm.register_domain(Box::new(master)).unwrap();
        dm.register_constraint(1, 0, slave_table()).unwrap();
        dm.policy_update(1, Window { min: 1200, max: 2000 }).unwrap();

        assert_eq!(dm.resolve_and_apply(1, 1000).unwrap(), 1200);
    }

    #[test]
    fn slave_failure_leaves_master_untouched() {
        let mut slave = MockDomainScaler::new();
        slave.expect_domain_id().return_const(0usize);
        slave
            .expect_set_floor()
            .times(1)
            .returning(|_| Err(ScaleError::DomainDisabled { domain: 0 }));

        let mut master = MockDomainScaler::new();
        master.expect_domain_id().return_const(1usize);
        // scale_to not programmed: any master scale would panic the mock

        let mut dm = DvfsManager::new();
        dm.register_domain(Box::new(slave)).unwrap();
        dm.register_domain(Box::new(master)).unwrap();
        dm.register_constraint(1, 0, slave_table()).unwrap();

        assert!(matches!(
            dm.resolve_and_apply(1, 2000),
            Err(DmError::SlaveFloor { slave: 0, .. })
        ));
    }

    #[test]
    fn registration_errors() {
        let mut a = MockDomainScaler::new();
        a.expect_domain_id().return_const(0usize);
        let mut b = MockDomainScaler::new();
        b.expect_domain_id().return_const(0usize);

        let mut dm = DvfsManager::new();
        dm.register_domain(Box::new(a)).unwrap();
        assert!(matches!(
            dm.register_domain(Box::new(b)),
            Err(DmError::DuplicateDomain { id: 0 })
        ));
        assert!(matches!(
            dm.register_constraint(0, 7, slave_table()),
            Err(DmError::UnknownDomain { id: 7 })
        ));
        assert!(matches!(
            dm.policy_update(3, Window { min: 0, max: 1 }),
            Err(DmError::UnknownDomain { id: 3 })
        ));
    }
}

//! Frequency domains and the process-wide domain registry.

use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use snafu::{ensure, ResultExt, Snafu};
use spin::Mutex;

use crate::config::{DomainConfig, DomainId};
use crate::freq::{ConstraintSet, FrequencyTable, Khz, TableError};
use crate::platform::{Calibration, ClusterPower, CpuId, CpuSet};

/// Errors constructing or registering a domain.
#[derive(Debug, Snafu)]
pub enum DomainError {
    /// The device-tree frequency list and the capability bounds leave no
    /// usable operating point.
    #[snafu(display("domain {id}: unusable frequency table"))]
    UnusableTable {
        /// Offending domain.
        id: DomainId,
        /// Underlying table construction failure.
        source: TableError,
    },
    /// A domain with this id is already registered.
    #[snafu(display("domain {id} registered twice"))]
    DuplicateId {
        /// The repeated id.
        id: DomainId,
    },
}

/// The mutable scaling state of one domain, guarded by the domain mutex.
#[derive(Debug, Clone, Copy)]
pub struct DomainState {
    /// Whether the domain accepts scaling requests.
    pub enabled: bool,
    /// Set when a consistency fault took the domain out of service.
    pub faulted: bool,
    /// Last frequency the engine committed to hardware.
    pub current: Khz,
    /// Thermal clip ceiling applied to every target.
    pub clipped: Khz,
}

/// One independently clocked frequency domain.
///
/// Static description (table, bounds, calibration handle) is immutable after
/// construction; the scaling state and the QoS request set live behind their
/// own mutexes per the locking layout in the driver docs.
pub struct Domain<C, P> {
    id: DomainId,
    cpus: CpuSet,
    cal: C,
    power: P,
    table: FrequencyTable,
    min_freq: Khz,
    max_freq: Khz,
    boot_freq: Khz,
    resume_freq: Khz,
    need_awake: bool,
    pub(crate) state: Mutex<DomainState>,
    pub(crate) qos: Mutex<ConstraintSet>,
    online: Mutex<CpuSet>,
}

impl<C: Calibration, P: ClusterPower> Domain<C, P> {
    /// Build a domain from its device-tree description and hardware handles.
    ///
    /// Capability bounds combine the calibration limits with the device-tree
    /// ones, the tighter side winning. The initial tracked frequency is read
    /// from hardware; a reading outside the final table falls back to the
    /// boot frequency with a warning, matching how out-of-spec bootloader
    /// settings are handled.
    ///
    /// # Errors
    /// [`DomainError::UnusableTable`] when no table entry survives the
    /// bounds.
    pub fn new(cfg: &DomainConfig, cal: C, power: P) -> Result<Self, DomainError> {
        let min_freq = cal.min_rate().max(cfg.dt_min);
        let max_freq = cal.max_rate().min(cfg.dt_max);
        let table = FrequencyTable::new(&cfg.raw_table, min_freq, max_freq)
            .context(UnusableTableSnafu { id: cfg.id })?;

        let boot_freq = table.snap_down(cal.boot_rate());
        let resume_freq = table.snap_down(cal.resume_rate());

        let mut current = cal.current_rate();
        if !table.contains(current) {
            log::warn!(
                "domain {}: initial rate {current} kHz not in table, assuming boot rate {boot_freq} kHz",
                cfg.id
            );
            current = boot_freq;
        }

        log::info!(
            "domain {}: {} entries, {}..{} kHz, starting at {current} kHz",
            cfg.id,
            table.len(),
            table.lowest(),
            table.highest()
        );

        Ok(Domain {
            id: cfg.id,
            cpus: cfg.cpus,
            cal,
            power,
            table,
            min_freq,
            max_freq,
            boot_freq,
            resume_freq,
            need_awake: cfg.need_awake,
            state: Mutex::new(DomainState {
                enabled: true,
                faulted: false,
                current,
                clipped: max_freq,
            }),
            qos: Mutex::new(ConstraintSet::new(min_freq, max_freq)),
            online: Mutex::new(cfg.cpus),
        })
    }

    /// Registry identifier.
    pub fn id(&self) -> DomainId {
        self.id
    }

    /// CPUs this domain clocks.
    pub fn cpus(&self) -> CpuSet {
        self.cpus
    }

    /// The frequency table.
    pub fn table(&self) -> &FrequencyTable {
        &self.table
    }

    /// Effective lower capability bound.
    pub fn min_freq(&self) -> Khz {
        self.min_freq
    }

    /// Effective upper capability bound.
    pub fn max_freq(&self) -> Khz {
        self.max_freq
    }

    /// Frequency the domain boots at.
    pub fn boot_freq(&self) -> Khz {
        self.boot_freq
    }

    /// Frequency pinned across system sleep.
    pub fn resume_freq(&self) -> Khz {
        self.resume_freq
    }

    pub(crate) fn calibration(&self) -> &C {
        &self.cal
    }

    pub(crate) fn power(&self) -> &P {
        &self.power
    }

    pub(crate) fn need_awake(&self) -> bool {
        self.need_awake
    }

    /// Last frequency the engine committed.
    pub fn current(&self) -> Khz {
        self.state.lock().current
    }

    /// The thermal clip ceiling.
    pub fn clipped(&self) -> Khz {
        self.state.lock().clipped
    }

    /// Whether the domain accepts scaling requests.
    pub fn enabled(&self) -> bool {
        let s = self.state.lock();
        s.enabled && !s.faulted
    }

    /// Enable or disable scaling. A faulted domain stays disabled.
    pub fn set_enabled(&self, enabled: bool) {
        let mut s = self.state.lock();
        if s.faulted {
            return;
        }
        s.enabled = enabled;
    }

    /// The frequency the hardware reports right now.
    ///
    /// While every CPU of the domain is offline the clock hardware may be
    /// unreadable, and during a transition the calibration layer reports `0`;
    /// both cases return the tracked value instead.
    pub fn hardware_rate(&self) -> Khz {
        let tracked = self.current();
        if !self.cpus.is_empty() && self.online.lock().is_empty() {
            return tracked;
        }
        match self.cal.current_rate() {
            0 => tracked,
            rate => rate,
        }
    }

    /// Record `cpu` coming online.
    pub fn cpu_online(&self, cpu: CpuId) {
        self.online.lock().insert(cpu);
    }

    /// Record `cpu` going offline. Returns `true` when it was the domain's
    /// last online CPU.
    pub fn cpu_offline(&self, cpu: CpuId) -> bool {
        let mut online = self.online.lock();
        online.remove(cpu);
        online.is_empty()
    }

    /// CPUs of the domain currently online.
    pub fn online_cpus(&self) -> CpuSet {
        *self.online.lock()
    }
}

/// All domains of the system, frozen after probe.
///
/// Owned by the driver object rather than living in a global, so tests can
/// build as many as they like.
pub struct Registry<C, P> {
    domains: Vec<Arc<Domain<C, P>>>,
    by_id: HashMap<DomainId, usize>,
    by_cpu: HashMap<CpuId, usize>,
}

impl<C: Calibration, P: ClusterPower> Registry<C, P> {
    /// An empty registry.
    pub fn new() -> Self {
        Registry {
            domains: Vec::new(),
            by_id: HashMap::new(),
            by_cpu: HashMap::new(),
        }
    }

    /// Add a domain.
    ///
    /// # Errors
    /// [`DomainError::DuplicateId`] if its id is already present.
    pub fn register(&mut self, domain: Arc<Domain<C, P>>) -> Result<(), DomainError> {
        ensure!(
            !self.by_id.contains_key(&domain.id()),
            DuplicateIdSnafu { id: domain.id() }
        );
        let index = self.domains.len();
        self.by_id.insert(domain.id(), index);
        for cpu in domain.cpus().iter() {
            self.by_cpu.insert(cpu, index);
        }
        self.domains.push(domain);
        Ok(())
    }

    /// Look a domain up by id.
    pub fn by_id(&self, id: DomainId) -> Option<&Arc<Domain<C, P>>> {
        self.by_id.get(&id).map(|&i| &self.domains[i])
    }

    /// Look a domain up by one of its CPUs.
    pub fn by_cpu(&self, cpu: CpuId) -> Option<&Arc<Domain<C, P>>> {
        self.by_cpu.get(&cpu).map(|&i| &self.domains[i])
    }

    /// Iterate over every registered domain.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Domain<C, P>>> {
        self.domains.iter()
    }

    /// Number of registered domains.
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// Whether no domain is registered.
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

impl<C: Calibration, P: ClusterPower> Default for Registry<C, P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use alloc::vec;

    use crate::platform::{MockCalibration, MockClusterPower};

    use super::*;

    /// A calibration mock for a 400..2000 kHz domain idling at 800 kHz.
    pub(crate) fn test_cal(current: Khz) -> MockCalibration {
        let mut cal = MockCalibration::new();
        cal.expect_min_rate().return_const(400u32);
        cal.expect_max_rate().return_const(2000u32);
        cal.expect_boot_rate().return_const(800u32);
        cal.expect_resume_rate().return_const(800u32);
        cal.expect_current_rate().return_const(current);
        cal.expect_rate_table()
            .returning(|| vec![2000, 1600, 1200, 800, 400]);
        cal
    }

    pub(crate) fn test_config(id: DomainId, cpus: &[CpuId]) -> DomainConfig {
        DomainConfig {
            id,
            cpus: CpuSet::from_ids(cpus),
            dt_min: 400,
            dt_max: 2000,
            raw_table: vec![2000, 1600, 1200, 800, 400],
            need_awake: false,
        }
    }

    pub(crate) fn test_domain(
        id: DomainId,
        cpus: &[CpuId],
    ) -> Domain<MockCalibration, MockClusterPower> {
        let mut power = MockClusterPower::new();
        power.expect_hold().return_const(());
        power.expect_release().return_const(());
        Domain::new(&test_config(id, cpus), test_cal(800), power).expect("build domain")
    }

    #[test]
    fn bounds_combine_dt_and_calibration() {
        let mut cfg = test_config(0, &[0, 1]);
        cfg.dt_min = 600;
        cfg.dt_max = 1800;
        let power = MockClusterPower::new();
        let d = Domain::new(&cfg, test_cal(800), power).expect("build domain");
        assert_eq!(d.min_freq(), 600);
        assert_eq!(d.max_freq(), 1800);
        // 2000 and 400 dropped by the narrowed bounds
        assert_eq!(d.table().highest(), 1600);
        assert_eq!(d.table().lowest(), 800);
    }

    #[test]
    fn out_of_table_initial_rate_falls_back_to_boot() {
        let power = MockClusterPower::new();
        let d = Domain::new(&test_config(0, &[0, 1]), test_cal(1234), power)
            .expect("build domain");
        assert_eq!(d.current(), 800);
    }

    #[test]
    fn hardware_rate_masks_transitions_and_offline() {
        let d = test_domain(0, &[0, 1]);
        assert_eq!(d.hardware_rate(), 800);

        // everyone offline: tracked value wins even if cal would answer
        d.cpu_offline(0);
        assert!(d.cpu_offline(1));
        assert_eq!(d.hardware_rate(), 800);
    }

    #[test]
    fn zero_rate_reading_returns_tracked() {
        let power = MockClusterPower::new();
        let mut cal = MockCalibration::new();
        cal.expect_min_rate().return_const(400u32);
        cal.expect_max_rate().return_const(2000u32);
        cal.expect_boot_rate().return_const(800u32);
        cal.expect_resume_rate().return_const(800u32);
        // first read at init says 800, later reads say "in flight"
        let mut first = true;
        cal.expect_current_rate().returning(move || {
            if first {
                first = false;
                800
            } else {
                0
            }
        });
        let d = Domain::new(&test_config(0, &[0]), cal, power).expect("build domain");
        assert_eq!(d.hardware_rate(), 800);
    }

    #[test]
    fn registry_lookup_and_duplicates() {
        let mut reg = Registry::new();
        reg.register(Arc::new(test_domain(0, &[0, 1, 2, 3]))).unwrap();
        reg.register(Arc::new(test_domain(1, &[4, 5, 6, 7]))).unwrap();

        assert_eq!(reg.by_cpu(5).map(|d| d.id()), Some(1));
        assert_eq!(reg.by_id(0).map(|d| d.id()), Some(0));
        assert!(reg.by_cpu(9).is_none());

        assert!(matches!(
            reg.register(Arc::new(test_domain(1, &[8]))),
            Err(DomainError::DuplicateId { id: 1 })
        ));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn faulted_domain_cannot_be_reenabled() {
        let d = test_domain(0, &[0]);
        {
            let mut s = d.state.lock();
            s.faulted = true;
            s.enabled = false;
        }
        d.set_enabled(true);
        assert!(!d.enabled());
    }
}

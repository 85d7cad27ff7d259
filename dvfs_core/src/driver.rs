//! The policy-facing driver layer.
//!
//! Owns the domain registry, the constraint manager and the transition
//! observers, and exposes the operations the cpufreq-style policy core
//! calls: verify, target, get, hotplug, suspend/resume, thermal cooling and
//! the boot-time performance pin.

use alloc::boxed::Box;
use alloc::sync::Arc;
use snafu::{OptionExt, ResultExt, Snafu};
use spin::Mutex;

use crate::afm::CeilingSink;
use crate::config::{ConstraintConfig, ConstraintSource, DomainId};
use crate::dm::{ConstraintTable, DmError, DomainScaler, DvfsManager};
use crate::domain::{Domain, Registry};
use crate::freq::{Khz, QosError, Relation, RequestKind, Window};
use crate::platform::{Calibration, Clock, ClusterPower, CpuId, DelayTimer};
use crate::scaling::{ScaleError, TransitionNotifier};
use crate::snapshot::Snapshot;

/// Errors from driver operations.
#[derive(Debug, Snafu)]
pub enum DriverError {
    /// No domain clocks this CPU.
    #[snafu(display("cpu {cpu} belongs to no frequency domain"))]
    UnknownCpu {
        /// The unmatched CPU.
        cpu: CpuId,
    },
    /// No domain has this id.
    #[snafu(display("no frequency domain with id {id}"))]
    UnknownDomain {
        /// The unmatched id.
        id: DomainId,
    },
    /// A QoS request operation failed.
    #[snafu(display("qos request update failed"))]
    Qos {
        /// Underlying aggregator failure.
        source: QosError,
    },
    /// The constraint manager refused the operation.
    #[snafu(display("constraint manager operation failed"))]
    Dm {
        /// Underlying manager failure.
        source: DmError,
    },
    /// Scaling the domain failed.
    #[snafu(display("scaling failed"))]
    Scale {
        /// Underlying engine failure.
        source: ScaleError,
    },
}

/// Boot-time performance pin: both QoS sides held at `freq` (capped at the
/// domain ceiling) until `release_ms` after probe.
#[derive(Debug, Clone, Copy)]
pub struct BootBoost {
    /// Frequency to pin.
    pub freq: Khz,
    /// How long the pin lasts.
    pub release_ms: u32,
}

/// One domain's scaling surface, shared with the constraint manager and the
/// throttling machinery.
pub struct DomainHandle<C, P, N, K> {
    domain: Arc<Domain<C, P>>,
    notifier: Arc<N>,
    snapshot: Arc<Snapshot<K>>,
}

impl<C, P, N, K> Clone for DomainHandle<C, P, N, K> {
    fn clone(&self) -> Self {
        DomainHandle {
            domain: self.domain.clone(),
            notifier: self.notifier.clone(),
            snapshot: self.snapshot.clone(),
        }
    }
}

impl<C, P, N, K> DomainHandle<C, P, N, K>
where
    C: Calibration,
    P: ClusterPower,
    N: TransitionNotifier,
    K: Clock,
{
    /// The domain this handle drives.
    pub fn domain(&self) -> &Arc<Domain<C, P>> {
        &self.domain
    }

    fn scale(&self, target: Khz, relation: Relation) -> Result<Khz, ScaleError> {
        self.domain
            .scale(target, relation, &*self.notifier, &self.snapshot)
    }

    /// Update one QoS request and bring the domain inside the new window.
    fn drive_request(&self, kind: RequestKind, value: Khz) -> Result<Window, DriverError> {
        let window = self
            .domain
            .qos
            .lock()
            .update(kind, value)
            .context(QosSnafu)?;
        self.settle_into(window)?;
        Ok(window)
    }

    /// Scale the domain into `window` if it currently runs outside it.
    fn settle_into(&self, window: Window) -> Result<(), DriverError> {
        let current = self.domain.current();
        if current < window.min {
            self.scale(window.min, Relation::Lowest).context(ScaleSnafu)?;
        } else if current > window.max {
            self.scale(window.max, Relation::Highest).context(ScaleSnafu)?;
        }
        Ok(())
    }
}

impl<C, P, N, K> DomainScaler for DomainHandle<C, P, N, K>
where
    C: Calibration + Send + Sync,
    P: ClusterPower + Send + Sync,
    N: TransitionNotifier,
    K: Clock,
{
    fn domain_id(&self) -> DomainId {
        self.domain.id()
    }

    fn set_floor(&self, floor: Khz) -> Result<(), ScaleError> {
        let window = {
            let mut qos = self.domain.qos.lock();
            match qos.update(RequestKind::DriverMin, floor) {
                Ok(w) => w,
                Err(e) => {
                    // DriverMin is registered at probe, this cannot happen
                    log::error!("domain {}: floor update failed: {e}", self.domain.id());
                    return Ok(());
                }
            }
        };
        // a floor above the current frequency is settled by the caller's
        // cascade, only a ceiling violation is corrected here
        if self.domain.current() > window.max {
            self.scale(window.max, Relation::Highest)?;
        }
        Ok(())
    }

    fn scale_to(&self, target: Khz, relation: Relation) -> Result<Khz, ScaleError> {
        self.scale(target, relation)
    }

    fn current(&self) -> Khz {
        self.domain.current()
    }
}

impl<C, P, N, K> CeilingSink for DomainHandle<C, P, N, K>
where
    C: Calibration + Send + Sync,
    P: ClusterPower + Send + Sync,
    N: TransitionNotifier,
    K: Clock,
{
    fn set_ceiling(&self, ceiling: Khz) {
        let window = {
            let mut qos = self.domain.qos.lock();
            match qos.update(RequestKind::ThermalMax, ceiling) {
                Ok(w) => w,
                Err(e) => {
                    log::error!("domain {}: ceiling update failed: {e}", self.domain.id());
                    return;
                }
            }
        };
        if let Err(e) = self.settle_into(window) {
            // the clamp request stays recorded, retried on the next scale
            log::error!("domain {}: applying ceiling failed: {e}", self.domain.id());
        }
    }
}

/// The driver object.
pub struct CpufreqDriver<C, P, N, K, T> {
    registry: Registry<C, P>,
    dm: Mutex<DvfsManager>,
    notifier: Arc<N>,
    snapshot: Arc<Snapshot<K>>,
    boot_timer: T,
    boot: Option<BootBoost>,
}

impl<C, P, N, K, T> CpufreqDriver<C, P, N, K, T>
where
    C: Calibration + Send + Sync + 'static,
    P: ClusterPower + Send + Sync + 'static,
    N: TransitionNotifier + 'static,
    K: Clock + 'static,
    T: DelayTimer,
{
    /// Build the driver over a populated registry.
    ///
    /// Registers every domain with the constraint manager, seeds the five
    /// QoS requests per domain at their hardware bounds and publishes the
    /// initial policy windows.
    ///
    /// # Errors
    /// Propagates registration failures; they indicate an inconsistent
    /// probe configuration.
    pub fn new(
        registry: Registry<C, P>,
        notifier: N,
        snapshot: Snapshot<K>,
        boot_timer: T,
        boot: Option<BootBoost>,
    ) -> Result<Self, DriverError> {
        let notifier = Arc::new(notifier);
        let snapshot = Arc::new(snapshot);
        let mut dm = DvfsManager::new();

        for domain in registry.iter() {
            {
                let mut qos = domain.qos.lock();
                let (min, max) = (domain.min_freq(), domain.max_freq());
                qos.add(RequestKind::DriverMin, min).context(QosSnafu)?;
                qos.add(RequestKind::DriverMax, max).context(QosSnafu)?;
                qos.add(RequestKind::UserMin, min).context(QosSnafu)?;
                qos.add(RequestKind::UserMax, max).context(QosSnafu)?;
                qos.add(RequestKind::ThermalMax, max).context(QosSnafu)?;
            }
            let handle = DomainHandle {
                domain: domain.clone(),
                notifier: notifier.clone(),
                snapshot: snapshot.clone(),
            };
            dm.register_domain(Box::new(handle)).context(DmSnafu)?;
            dm.policy_update(domain.id(), domain.qos.lock().window())
                .context(DmSnafu)?;
        }

        Ok(CpufreqDriver {
            registry,
            dm: Mutex::new(dm),
            notifier,
            snapshot,
            boot_timer,
            boot,
        })
    }

    /// Register a master/slave constraint from its probe declaration.
    ///
    /// # Errors
    /// [`DriverError::UnknownDomain`] for an undeclared side, plus the
    /// manager's own registration failures.
    pub fn register_constraint(&self, cfg: &ConstraintConfig) -> Result<(), DriverError> {
        let master = self
            .registry
            .by_id(cfg.master)
            .context(UnknownDomainSnafu { id: cfg.master })?;
        let table = match &cfg.source {
            ConstraintSource::Pairs(pairs) => {
                let slave = self
                    .registry
                    .by_id(cfg.slave)
                    .context(UnknownDomainSnafu { id: cfg.slave })?;
                ConstraintTable::from_pairs(pairs, master.table(), slave.table())
            }
            ConstraintSource::Calibration(rows) => {
                ConstraintTable::from_calibration(rows, master.table())
            }
        };
        self.dm
            .lock()
            .register_constraint(cfg.master, cfg.slave, table)
            .context(DmSnafu)
    }

    /// A shareable handle to the domain clocking `cpu`, for wiring the
    /// throttling machinery.
    pub fn domain_handle(&self, cpu: CpuId) -> Option<DomainHandle<C, P, N, K>> {
        self.registry.by_cpu(cpu).map(|domain| DomainHandle {
            domain: domain.clone(),
            notifier: self.notifier.clone(),
            snapshot: self.snapshot.clone(),
        })
    }

    /// The transition trace ring.
    pub fn snapshot(&self) -> &Arc<Snapshot<K>> {
        &self.snapshot
    }

    /// The domain registry.
    pub fn registry(&self) -> &Registry<C, P> {
        &self.registry
    }

    fn handle_for(&self, cpu: CpuId) -> Result<DomainHandle<C, P, N, K>, DriverError> {
        self.domain_handle(cpu).context(UnknownCpuSnafu { cpu })
    }

    /// Validate and apply a requested policy window for `cpu`'s domain.
    ///
    /// Both bounds are snapped onto the table, the floor upward and the
    /// ceiling downward, pushed into the user QoS requests and forwarded to
    /// the constraint manager. Returns the effective window.
    ///
    /// # Errors
    /// See [`DriverError`].
    pub fn verify(&self, cpu: CpuId, min: Khz, max: Khz) -> Result<Window, DriverError> {
        let handle = self.handle_for(cpu)?;
        let domain = handle.domain();
        let table = domain.table();
        let min = table.resolve(min, Relation::Lowest).unwrap_or_else(|| table.highest());
        let max = table.resolve(max, Relation::Highest).unwrap_or_else(|| table.lowest());

        let window = {
            let mut qos = domain.qos.lock();
            qos.update(RequestKind::UserMin, min).context(QosSnafu)?;
            qos.update(RequestKind::UserMax, max).context(QosSnafu)?
        };

        let clipped = domain.clipped();
        self.dm
            .lock()
            .policy_update(
                domain.id(),
                Window {
                    min: window.min.min(clipped),
                    max: window.max.min(clipped),
                },
            )
            .context(DmSnafu)?;
        handle.settle_into(window)?;
        Ok(window)
    }

    /// Scale `cpu`'s domain toward `target`.
    ///
    /// Routed through the constraint manager when the domain masters any
    /// constraint, so dependent domains move first; otherwise the engine is
    /// driven directly. Returns the resulting frequency.
    ///
    /// # Errors
    /// See [`DriverError`].
    pub fn target(&self, cpu: CpuId, target: Khz) -> Result<Khz, DriverError> {
        let handle = self.handle_for(cpu)?;
        let domain = handle.domain();
        let target = target.min(domain.clipped());

        let dm = self.dm.lock();
        if dm.has_constraints(domain.id()) {
            dm.resolve_and_apply(domain.id(), target).context(DmSnafu)
        } else {
            drop(dm);
            let window = domain.qos.lock().window();
            handle
                .scale(target.clamp(window.min, window.max), Relation::Highest)
                .context(ScaleSnafu)
        }
    }

    /// The frequency `cpu`'s domain runs at, preferring the hardware
    /// reading.
    pub fn get(&self, cpu: CpuId) -> Option<Khz> {
        self.registry.by_cpu(cpu).map(|d| d.hardware_rate())
    }

    /// A CPU of some domain came online.
    ///
    /// The first CPU back re-enables the domain and lifts the driver
    /// ceiling back to the hardware maximum.
    ///
    /// # Errors
    /// See [`DriverError`].
    pub fn online(&self, cpu: CpuId) -> Result<(), DriverError> {
        let handle = self.handle_for(cpu)?;
        let domain = handle.domain();
        domain.cpu_online(cpu);
        domain.set_enabled(true);
        let window = handle.drive_request(RequestKind::DriverMax, domain.max_freq())?;
        self.dm
            .lock()
            .policy_update(domain.id(), window)
            .context(DmSnafu)?;
        Ok(())
    }

    /// A CPU of some domain went offline.
    ///
    /// The last CPU out parks the domain at its minimum and disables it.
    ///
    /// # Errors
    /// See [`DriverError`].
    pub fn offline(&self, cpu: CpuId) -> Result<(), DriverError> {
        let handle = self.handle_for(cpu)?;
        let domain = handle.domain();
        if !domain.cpu_offline(cpu) {
            return Ok(());
        }
        let window = handle.drive_request(RequestKind::DriverMax, domain.min_freq())?;
        self.dm
            .lock()
            .policy_update(domain.id(), window)
            .context(DmSnafu)?;
        domain.set_enabled(false);
        Ok(())
    }

    /// Park every domain at its resume frequency for system sleep.
    ///
    /// Cancels the boot pin first and drives the parking through the QoS
    /// requests, so an unexpected wakeup-time request cannot land outside
    /// the parked window.
    ///
    /// # Errors
    /// See [`DriverError`].
    pub fn suspend(&self) -> Result<(), DriverError> {
        self.boot_timer.cancel_and_wait();
        for domain in self.registry.iter() {
            let handle = DomainHandle {
                domain: domain.clone(),
                notifier: self.notifier.clone(),
                snapshot: self.snapshot.clone(),
            };
            let resume = domain.resume_freq();
            handle.drive_request(RequestKind::DriverMax, resume)?;
            handle.drive_request(RequestKind::DriverMin, resume)?;
            log::info!("domain {}: parked at {resume} kHz for sleep", domain.id());
        }
        Ok(())
    }

    /// Release the sleep parking on every domain.
    ///
    /// # Errors
    /// See [`DriverError`].
    pub fn resume(&self) -> Result<(), DriverError> {
        for domain in self.registry.iter() {
            let handle = DomainHandle {
                domain: domain.clone(),
                notifier: self.notifier.clone(),
                snapshot: self.snapshot.clone(),
            };
            handle.drive_request(RequestKind::DriverMin, domain.min_freq())?;
            handle.drive_request(RequestKind::DriverMax, domain.max_freq())?;
        }
        Ok(())
    }

    /// Thermal cooling request: cap `cpu`'s domain at `ceiling`.
    ///
    /// The cap is snapped onto the table, stored as the clip frequency,
    /// folded into the constraint manager's policy window, and the domain is
    /// re-targeted at its current frequency so an over-cap frequency drops
    /// immediately. Returns the snapped cap.
    ///
    /// # Errors
    /// See [`DriverError`].
    pub fn cooling_request(&self, cpu: CpuId, ceiling: Khz) -> Result<Khz, DriverError> {
        let handle = self.handle_for(cpu)?;
        let domain = handle.domain();
        let clipped = domain.set_clipped(ceiling);

        let window = domain.qos.lock().window();
        self.dm
            .lock()
            .policy_update(
                domain.id(),
                Window {
                    min: window.min.min(clipped),
                    max: window.max.min(clipped),
                },
            )
            .context(DmSnafu)?;

        let current = domain.current();
        if current > clipped {
            handle.scale(clipped, Relation::Highest).context(ScaleSnafu)?;
        }
        log::info!("domain {}: cooling cap {clipped} kHz", domain.id());
        Ok(clipped)
    }

    /// Pin every domain to its boot-boost frequency and arm the release
    /// timer. No-op when no boost was configured.
    ///
    /// # Errors
    /// See [`DriverError`].
    pub fn start_boot_boost(&self) -> Result<(), DriverError> {
        let Some(boost) = self.boot else {
            return Ok(());
        };
        for domain in self.registry.iter() {
            let handle = DomainHandle {
                domain: domain.clone(),
                notifier: self.notifier.clone(),
                snapshot: self.snapshot.clone(),
            };
            let pin = boost.freq.min(domain.max_freq());
            handle.drive_request(RequestKind::DriverMax, pin)?;
            handle.drive_request(RequestKind::DriverMin, pin)?;
            log::info!("domain {}: boot pin at {pin} kHz", domain.id());
        }
        self.boot_timer.schedule(boost.release_ms);
        Ok(())
    }

    /// Boot-boost timer expiry: release the pins.
    ///
    /// # Errors
    /// See [`DriverError`].
    pub fn finish_boot_boost(&self) -> Result<(), DriverError> {
        for domain in self.registry.iter() {
            let handle = DomainHandle {
                domain: domain.clone(),
                notifier: self.notifier.clone(),
                snapshot: self.snapshot.clone(),
            };
            handle.drive_request(RequestKind::DriverMin, domain.min_freq())?;
            handle.drive_request(RequestKind::DriverMax, domain.max_freq())?;
        }
        Ok(())
    }
}

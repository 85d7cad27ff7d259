//! Adaptive frequency throttling driven by the overcurrent monitor.
//!
//! Each CPU cluster with an overcurrent comparator gets one [`AfmDomain`].
//! The interrupt handler only acknowledges ownership of the shared line and
//! queues the clamp step onto a CPU of the cluster; the queued work lowers
//! the cluster's frequency ceiling by a fixed number of table levels, and a
//! delayed release decision lifts the clamp again once conditions allow.

pub mod stats;

use spin::Mutex;

#[cfg(test)]
use mockall::automock;

use crate::config::{AfmConfig, DomainId};
use crate::freq::{FrequencyTable, Khz};
use crate::platform::{AfmScheduler, Clock, CpuId, CpuSet, OvercurrentMonitor};

use stats::AfmStats;

/// Width of the instantaneous-power threshold field in the monitor register.
const IRP_FIELD_MAX: u32 = 0x3f;

/// Where the throttle ceiling lands. The production implementation routes
/// this into the domain's thermal-max QoS request.
#[cfg_attr(test, automock)]
pub trait CeilingSink: Send + Sync {
    /// Apply `ceiling` as the cluster's frequency ceiling.
    fn set_ceiling(&self, ceiling: Khz);
}

/// Decides whether a pending clamp may be lifted when the release timer
/// fires.
pub trait ReleasePolicy: Send + Sync {
    /// `true` lifts the clamp, `false` re-arms the timer.
    fn should_release(&self) -> bool;
}

/// The production policy: no extra hold condition, release on first expiry.
pub struct AlwaysRelease;

impl ReleasePolicy for AlwaysRelease {
    fn should_release(&self) -> bool {
        true
    }
}

struct AfmState {
    enabled: bool,
    /// A clamp is currently in effect.
    throttling: bool,
    /// The ceiling currently imposed on the domain. Clamp steps walk down
    /// from here, not from whatever the governor happens to run at.
    clipped: Khz,
    online: CpuSet,
    active_cpu: Option<CpuId>,
}

/// The throttling state machine for one cluster.
pub struct AfmDomain<H, S, C, K, R = AlwaysRelease> {
    monitor: H,
    sched: S,
    sink: C,
    clock: K,
    release: R,
    table: FrequencyTable,
    domain: DomainId,
    cpus: CpuSet,
    max_freq_wo_afm: Khz,
    down_step: Mutex<usize>,
    release_duration_ms: Mutex<u32>,
    state: Mutex<AfmState>,
    stats: Mutex<AfmStats>,
}

impl<H, S, C, K> AfmDomain<H, S, C, K, AlwaysRelease>
where
    H: OvercurrentMonitor,
    S: AfmScheduler,
    C: CeilingSink,
    K: Clock,
{
    /// Build a cluster with the production release policy.
    pub fn new(cfg: &AfmConfig, table: FrequencyTable, monitor: H, sched: S, sink: C, clock: K) -> Self {
        Self::with_release_policy(cfg, table, monitor, sched, sink, clock, AlwaysRelease)
    }
}

impl<H, S, C, K, R> AfmDomain<H, S, C, K, R>
where
    H: OvercurrentMonitor,
    S: AfmScheduler,
    C: CeilingSink,
    K: Clock,
    R: ReleasePolicy,
{
    /// Build a cluster with an explicit release policy.
    pub fn with_release_policy(
        cfg: &AfmConfig,
        table: FrequencyTable,
        monitor: H,
        sched: S,
        sink: C,
        clock: K,
        release: R,
    ) -> Self {
        let stats = AfmStats::new(&table, clock.now_ms());
        AfmDomain {
            monitor,
            sched,
            sink,
            clock,
            release,
            domain: cfg.domain,
            cpus: cfg.cpus,
            max_freq_wo_afm: cfg.max_freq_wo_afm,
            down_step: Mutex::new(cfg.down_step),
            release_duration_ms: Mutex::new(cfg.release_duration_ms),
            state: Mutex::new(AfmState {
                enabled: true,
                throttling: false,
                clipped: table.highest(),
                online: cfg.cpus,
                active_cpu: cfg.cpus.first(),
            }),
            stats: Mutex::new(stats),
            table,
        }
    }

    /// Interrupt entry point for the shared overcurrent line.
    ///
    /// Returns `false` when this cluster's condition bit is clear and the
    /// line belongs to another cluster. Otherwise masks the interrupt and
    /// queues the clamp step on a CPU of the cluster.
    pub fn handle_interrupt(&self) -> bool {
        if !self.monitor.interrupt_pending() {
            return false;
        }
        self.monitor.set_interrupt_enabled(false);
        let state = self.state.lock();
        match state.active_cpu {
            Some(cpu) => self.sched.queue_throttle_on(cpu),
            None => {
                // whole cluster offline, nothing to clamp
                log::warn!("afm: domain {} interrupt with no online cpu", self.domain);
                self.monitor.clear_interrupt();
                self.monitor.set_interrupt_enabled(true);
            }
        }
        true
    }

    /// The queued clamp step, running on `current_cpu`.
    ///
    /// If the work landed on a CPU outside the cluster (the active CPU went
    /// away between queueing and running), it is re-queued instead of
    /// clamping from the wrong cluster's context.
    pub fn throttle_work(&self, current_cpu: CpuId) {
        let mut state = self.state.lock();
        if !state.enabled {
            return;
        }
        if !self.cpus.contains(current_cpu) {
            match state.active_cpu {
                Some(cpu) => self.sched.queue_throttle_on(cpu),
                None => log::warn!("afm: dropping throttle work, domain {} offline", self.domain),
            }
            return;
        }

        state.throttling = true;
        let ceiling = self.stepped_down(state.clipped);
        state.clipped = ceiling;
        self.sink.set_ceiling(ceiling);
        self.stats.lock().transition(ceiling, self.clock.now_ms());
        log::info!("afm: domain {} clamped to {ceiling} kHz", self.domain);

        self.monitor.clear_throttle_counter();
        self.monitor.clear_interrupt();
        self.monitor.set_interrupt_enabled(true);
        self.sched.schedule_release(*self.release_duration_ms.lock());
    }

    /// The delayed release decision.
    pub fn handle_release_timer(&self) {
        let mut state = self.state.lock();
        if !state.throttling {
            return;
        }
        if self.release.should_release() {
            state.throttling = false;
            let ceiling = self.table.highest();
            state.clipped = ceiling;
            self.sink.set_ceiling(ceiling);
            self.stats.lock().transition(ceiling, self.clock.now_ms());
            log::info!("afm: domain {} released", self.domain);
        } else {
            self.sched.schedule_release(*self.release_duration_ms.lock());
        }
    }

    /// Turn the whole mechanism on or off.
    ///
    /// Enabling arms the comparator before the clamp is lifted, so a still
    /// present overcurrent condition re-fires immediately. Disabling clamps
    /// to the fallback ceiling while the comparator is still armed, and only
    /// then turns it off.
    pub fn set_enabled(&self, enable: bool) {
        if enable {
            let mut state = self.state.lock();
            if state.enabled {
                return;
            }
            state.enabled = true;
            state.throttling = false;
            state.clipped = self.table.highest();
            self.monitor.set_warn_enabled(true);
            self.sink.set_ceiling(self.table.highest());
            self.stats.lock().transition(self.table.highest(), self.clock.now_ms());
            self.monitor.clear_interrupt();
            self.monitor.set_interrupt_enabled(true);
        } else {
            // join any in-flight release handler before changing state
            self.sched.cancel_release_and_wait();
            let mut state = self.state.lock();
            if !state.enabled {
                return;
            }
            state.enabled = false;
            state.throttling = false;
            state.clipped = self.max_freq_wo_afm;
            self.monitor.set_interrupt_enabled(false);
            self.sink.set_ceiling(self.max_freq_wo_afm);
            self.stats.lock().transition(self.max_freq_wo_afm, self.clock.now_ms());
            self.monitor.set_warn_enabled(false);
        }
    }

    /// Reprogram the instantaneous-power release threshold for a new
    /// operating point. Called from the pre-change transition notification.
    pub fn update_power_threshold(&self, cur: Khz) {
        let min = self.table.lowest();
        let irp = ((cur * 2) / min).saturating_sub(2).min(IRP_FIELD_MAX);
        self.monitor.set_power_threshold(irp);
    }

    /// Start the hardware throttle-event counter.
    pub fn profile_start(&self) {
        self.monitor.start_profile();
    }

    /// Stop the counter and return the number of throttle events seen.
    pub fn profile_end(&self) -> u32 {
        self.monitor.read_profile()
    }

    /// Record `cpu` of the cluster coming online.
    pub fn cpu_up(&self, cpu: CpuId) {
        if !self.cpus.contains(cpu) {
            return;
        }
        let mut state = self.state.lock();
        state.online.insert(cpu);
        state.active_cpu = state.online.first();
    }

    /// Record `cpu` of the cluster going offline.
    pub fn cpu_down(&self, cpu: CpuId) {
        if !self.cpus.contains(cpu) {
            return;
        }
        let mut state = self.state.lock();
        state.online.remove(cpu);
        state.active_cpu = state.online.first();
        if state.active_cpu.is_none() {
            log::info!("afm: domain {} fully offline", self.domain);
        }
    }

    /// Whether a clamp is currently in effect.
    pub fn throttling(&self) -> bool {
        self.state.lock().throttling
    }

    /// The domain whose ceiling this cluster clamps.
    pub fn domain_id(&self) -> DomainId {
        self.domain
    }

    /// The ceiling currently imposed on the domain.
    pub fn clipped_freq(&self) -> Khz {
        self.state.lock().clipped
    }

    /// Whether the mechanism is enabled.
    pub fn enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Current step size in table levels.
    pub fn down_step(&self) -> usize {
        *self.down_step.lock()
    }

    /// Change the step size. Values below 1 are rejected.
    pub fn set_down_step(&self, step: usize) {
        if step >= 1 {
            *self.down_step.lock() = step;
        }
    }

    /// Current release delay.
    pub fn release_duration_ms(&self) -> u32 {
        *self.release_duration_ms.lock()
    }

    /// Change the release delay.
    pub fn set_release_duration_ms(&self, ms: u32) {
        *self.release_duration_ms.lock() = ms;
    }

    /// Number of ceiling changes so far.
    pub fn total_trans(&self) -> u32 {
        self.stats.lock().total_trans()
    }

    /// Accumulated `(frequency, milliseconds)` ceiling residency rows.
    pub fn time_in_state(&self) -> alloc::vec::Vec<(Khz, u64)> {
        self.stats.lock().time_in_state(self.clock.now_ms())
    }

    /// The ceiling `down_step` table levels below `from`, clamped at the
    /// table floor.
    fn stepped_down(&self, from: Khz) -> Khz {
        let base = self.table.snap_down(from);
        let index = self.table.position(base).unwrap_or(0);
        let clamped = (index + *self.down_step.lock()).min(self.table.len() - 1);
        // index is always in range after the min()
        self.table.get(clamped).unwrap_or_else(|| self.table.lowest())
    }
}

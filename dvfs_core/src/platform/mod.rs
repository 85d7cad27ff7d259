//! Mechanism interfaces for the hardware/platform services the scaling core
//! drives: clock calibration, cluster power control, the overcurrent monitor
//! block, deferred work, and timekeeping.

mod cal;
mod cpu;
mod ocm;
mod power;
mod work;

pub use cal::{CalError, Calibration};
pub use cpu::{CpuId, CpuSet};
pub use ocm::OvercurrentMonitor;
pub use power::ClusterPower;
pub use work::{AfmScheduler, DelayTimer};

#[cfg(test)]
pub use cal::MockCalibration;
#[cfg(test)]
pub use ocm::MockOvercurrentMonitor;
#[cfg(test)]
pub use power::MockClusterPower;
#[cfg(test)]
pub use work::{MockAfmScheduler, MockDelayTimer};

#[cfg(test)]
use mockall::automock;

/// Monotonic time source used for statistics and trace timestamps.
#[cfg_attr(test, automock)]
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary fixed point in the past.
    fn now_ms(&self) -> u64;
}

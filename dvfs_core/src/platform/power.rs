//! Cluster power-mode control.

#[cfg(test)]
use mockall::automock;

use super::CpuId;

/// Keeps a cluster's power island up while its clock hardware is touched.
///
/// Some domains cannot have their frequency read or written while the
/// cluster-wide power mode is collapsed; the scaling engine brackets such
/// hardware accesses with [`hold`](ClusterPower::hold) /
/// [`release`](ClusterPower::release) on any CPU of the domain.
#[cfg_attr(test, automock)]
pub trait ClusterPower: Send + Sync {
    /// Prevent the cluster containing `cpu` from entering its collapsed
    /// power mode.
    fn hold(&self, cpu: CpuId);

    /// Allow the cluster containing `cpu` to enter its collapsed power
    /// mode again.
    fn release(&self, cpu: CpuId);
}

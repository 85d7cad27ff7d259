//! Overcurrent monitor block interface.

#[cfg(test)]
use mockall::automock;

/// Mechanism interface for one cluster's overcurrent/overvoltage monitor:
/// the on-die throttle comparator plus the PMIC warn line.
///
/// Several clusters can share one interrupt line, so the handler first asks
/// [`interrupt_pending`](OvercurrentMonitor::interrupt_pending) whether this
/// cluster's condition bit is actually set.
#[cfg_attr(test, automock)]
pub trait OvercurrentMonitor: Send + Sync {
    /// Whether this cluster's overcurrent condition bit is set.
    fn interrupt_pending(&self) -> bool;

    /// Mask or unmask the overcurrent interrupt.
    fn set_interrupt_enabled(&self, enable: bool);

    /// Acknowledge the overcurrent condition bit.
    fn clear_interrupt(&self);

    /// Reset the throttling-duration counter.
    fn clear_throttle_counter(&self);

    /// Turn the PMIC warn comparator on or off.
    fn set_warn_enabled(&self, enable: bool);

    /// Program the instantaneous-power release threshold for the current
    /// operating point. The value is a small unitless field; the monitor
    /// saturates it to the width of the hardware register.
    fn set_power_threshold(&self, irp: u32);

    /// Start the hardware throttle-event counter.
    fn start_profile(&self);

    /// Stop the hardware throttle-event counter and return its value.
    fn read_profile(&self) -> u32;
}

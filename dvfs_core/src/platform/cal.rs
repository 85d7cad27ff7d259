//! Clock calibration interface: the layer that actually reads and writes a
//! domain's hardware frequency.

use alloc::vec::Vec;
use snafu::Snafu;

#[cfg(test)]
use mockall::automock;

use crate::freq::Khz;

/// Errors reported by the calibration layer.
#[derive(Debug, Snafu)]
pub enum CalError {
    /// The hardware rejected the requested rate.
    #[snafu(display("calibration layer rejected rate change (code {code})"))]
    Rejected {
        /// Raw status code from the calibration firmware.
        code: i32,
    },
}

/// Mechanism interface for one domain's clock calibration handle.
///
/// Mirrors the chipset calibration firmware surface: capability bounds,
/// boot/resume defaults, the measured rate, and the rate-change request.
#[cfg_attr(test, automock)]
pub trait Calibration: Send + Sync {
    /// Highest rate the hardware supports.
    fn max_rate(&self) -> Khz;

    /// Lowest rate the hardware supports.
    fn min_rate(&self) -> Khz;

    /// Rate the hardware boots at.
    fn boot_rate(&self) -> Khz;

    /// Known-safe rate to pin while the system sleeps.
    fn resume_rate(&self) -> Khz;

    /// The rate the hardware currently reports.
    ///
    /// Returns `0` while a rate change is in flight; callers fall back to
    /// their tracked value in that case.
    fn current_rate(&self) -> Khz;

    /// Request a rate change.
    ///
    /// # Errors
    /// Returns [`CalError::Rejected`] if the calibration firmware refuses
    /// the transition; the hardware stays at its previous rate.
    fn set_rate(&self, rate: Khz) -> Result<(), CalError>;

    /// Every rate the calibration data tabulates for this domain,
    /// highest first. Used to validate externally supplied constraint data.
    fn rate_table(&self) -> Vec<Khz>;
}

//! Deferred-work surfaces.
//!
//! All timers here have explicit cancel-and-join semantics: `cancel_and_wait`
//! does not return until any in-flight expiry handler has finished, which the
//! AFM disable path depends on.

#[cfg(test)]
use mockall::automock;

use super::CpuId;

/// One-shot delayed work item.
#[cfg_attr(test, automock)]
pub trait DelayTimer: Send + Sync {
    /// Arm (or re-arm) the timer to fire once after `delay_ms`.
    fn schedule(&self, delay_ms: u32);

    /// Cancel the timer and wait for a concurrently running expiry handler
    /// to finish before returning.
    fn cancel_and_wait(&self);
}

/// Deferred-work surface for one AFM cluster.
///
/// The interrupt handler must not block, so the clamp-step runs as queued
/// work pinned to a CPU of the throttled cluster, and the release decision
/// runs off a delayed timer.
#[cfg_attr(test, automock)]
pub trait AfmScheduler: Send + Sync {
    /// Queue the clamp-step work to run on `cpu`.
    fn queue_throttle_on(&self, cpu: CpuId);

    /// Arm (or re-arm) the release timer to fire after `delay_ms`.
    fn schedule_release(&self, delay_ms: u32);

    /// Cancel the release timer and wait for an in-flight release handler
    /// to finish before returning.
    fn cancel_release_and_wait(&self);
}

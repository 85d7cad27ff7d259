//! Dynamic voltage/frequency scaling core: per-domain frequency tables, QoS
//! constraint aggregation, the hardware scaling engine, cross-domain
//! constraint resolution, and adaptive-frequency (overcurrent) throttling.
//!
//! All hardware access goes through the mechanism traits in [`platform`];
//! the chip-specific register backends live with the platform integration.
#![no_std]
#![deny(missing_docs)]

extern crate alloc;

#[cfg(all(test, not(target_os = "none")))]
#[macro_use]
extern crate std;

pub mod afm;
pub mod config;
pub mod dm;
pub mod domain;
pub mod driver;
pub mod freq;
pub mod platform;
pub mod scaling;
pub mod snapshot;
pub mod sysfs;

//! Probe-time configuration for domains, constraints and AFM clusters,
//! as parsed from the device tree by the platform glue.

use alloc::vec::Vec;
use snafu::{ensure, Snafu};

use crate::freq::Khz;
use crate::platform::CpuSet;

/// Identifies one frequency domain within the registry and the constraint
/// manager.
pub type DomainId = usize;

/// Errors validating probe-time configuration.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A domain's declared frequency bounds are inverted.
    #[snafu(display("domain {id}: min bound {min} kHz above max bound {max} kHz"))]
    InvertedBounds {
        /// Offending domain.
        id: DomainId,
        /// Declared lower bound.
        min: Khz,
        /// Declared upper bound.
        max: Khz,
    },
    /// A domain declared no raw frequency table.
    #[snafu(display("domain {id}: empty frequency table"))]
    EmptyTable {
        /// Offending domain.
        id: DomainId,
    },
    /// An AFM cluster config has a zero step size.
    #[snafu(display("afm cluster for cpus {cpus:?}: down_step must be at least 1"))]
    ZeroDownStep {
        /// Sibling set of the offending cluster.
        cpus: CpuSet,
    },
    /// A constraint declaration names the same domain on both sides.
    #[snafu(display("constraint: master and slave are both domain {id}"))]
    SelfConstraint {
        /// The repeated domain.
        id: DomainId,
    },
    /// A table-sourced constraint declaration carries no rows.
    #[snafu(display("constraint {master} -> {slave}: empty pair table"))]
    EmptyConstraint {
        /// Master side of the declaration.
        master: DomainId,
        /// Slave side of the declaration.
        slave: DomainId,
    },
}

/// Static description of one frequency domain.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// Registry identifier, also the constraint-manager domain type.
    pub id: DomainId,
    /// CPUs the domain clocks. Empty for CPU-less domains such as the
    /// cluster interconnect.
    pub cpus: CpuSet,
    /// Device-tree lower bound, combined with the calibration minimum
    /// (the larger wins).
    pub dt_min: Khz,
    /// Device-tree upper bound, combined with the calibration maximum
    /// (the smaller wins).
    pub dt_max: Khz,
    /// Raw frequency list from the device tree, any order.
    pub raw_table: Vec<Khz>,
    /// Whether the cluster power island must be held up around hardware
    /// rate accesses.
    pub need_awake: bool,
}

impl DomainConfig {
    /// Validate the declaration.
    ///
    /// # Errors
    /// See [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.dt_min <= self.dt_max,
            InvertedBoundsSnafu {
                id: self.id,
                min: self.dt_min,
                max: self.dt_max,
            }
        );
        ensure!(!self.raw_table.is_empty(), EmptyTableSnafu { id: self.id });
        Ok(())
    }
}

/// Where a constraint table's rows come from.
#[derive(Debug, Clone)]
pub enum ConstraintSource {
    /// Explicit `(master, slave)` frequency pairs from the device tree.
    Pairs(Vec<(Khz, Khz)>),
    /// Slave floors tabulated per master operating point in the chipset
    /// calibration data, keyed by exact master frequency.
    Calibration(Vec<(Khz, Khz)>),
}

/// Static description of one master/slave frequency dependency.
#[derive(Debug, Clone)]
pub struct ConstraintConfig {
    /// Domain whose target drives the constraint.
    pub master: DomainId,
    /// Domain whose floor the constraint raises.
    pub slave: DomainId,
    /// Row data.
    pub source: ConstraintSource,
}

impl ConstraintConfig {
    /// Validate the declaration.
    ///
    /// # Errors
    /// See [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.master != self.slave,
            SelfConstraintSnafu { id: self.master }
        );
        let rows = match &self.source {
            ConstraintSource::Pairs(rows) | ConstraintSource::Calibration(rows) => rows,
        };
        ensure!(
            !rows.is_empty(),
            EmptyConstraintSnafu {
                master: self.master,
                slave: self.slave,
            }
        );
        Ok(())
    }
}

/// Static description of one AFM cluster.
#[derive(Debug, Clone)]
pub struct AfmConfig {
    /// Domain whose ceiling the cluster clamps.
    pub domain: DomainId,
    /// Sibling CPUs of the cluster.
    pub cpus: CpuSet,
    /// Table levels to step down per throttle event.
    pub down_step: usize,
    /// Delay before the release timer considers lifting the clamp.
    pub release_duration_ms: u32,
    /// Ceiling to restore when AFM is turned off entirely.
    pub max_freq_wo_afm: Khz,
}

impl AfmConfig {
    /// Validate the declaration.
    ///
    /// # Errors
    /// See [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(self.down_step >= 1, ZeroDownStepSnafu { cpus: self.cpus });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    #[test]
    fn domain_validation() {
        let mut cfg = DomainConfig {
            id: 0,
            cpus: CpuSet::from_ids(&[0, 1, 2, 3]),
            dt_min: 400,
            dt_max: 2000,
            raw_table: vec![2000, 1600, 400],
            need_awake: false,
        };
        cfg.validate().unwrap();

        cfg.dt_min = 2100;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvertedBounds { .. })
        ));

        cfg.dt_min = 400;
        cfg.raw_table.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyTable { .. })));
    }

    #[test]
    fn constraint_validation() {
        let mut cfg = ConstraintConfig {
            master: 1,
            slave: 0,
            source: ConstraintSource::Pairs(vec![(2000, 1000)]),
        };
        cfg.validate().unwrap();

        cfg.slave = 1;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::SelfConstraint { id: 1 })
        ));

        cfg.slave = 0;
        cfg.source = ConstraintSource::Pairs(vec![]);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::EmptyConstraint { .. })
        ));
    }

    #[test]
    fn afm_validation() {
        let mut cfg = AfmConfig {
            domain: 1,
            cpus: CpuSet::from_ids(&[4, 5, 6, 7]),
            down_step: 1,
            release_duration_ms: 15,
            max_freq_wo_afm: 2000,
        };
        cfg.validate().unwrap();

        cfg.down_step = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroDownStep { .. })));
    }
}

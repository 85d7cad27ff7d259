//! Frequency units, tables and QoS constraint aggregation.

pub mod qos;
pub mod table;

pub use qos::{ConstraintSet, QosError, RequestKind, Window};
pub use table::{FrequencyTable, TableError};

/// A frequency in kilohertz.
pub type Khz = u32;

/// Frequency-table resolution policy for a target that falls between two
/// table entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Select the highest table entry that does not exceed the target.
    Highest,
    /// Select the lowest table entry that is not below the target.
    Lowest,
}

//! QoS constraint aggregation: independently-owned min/max frequency
//! requests combined into one resolved window per domain.

use hashbrown::HashMap;
use snafu::{ensure, Snafu};

use super::Khz;

/// The named requests a domain's constraint set can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Floor owned by the driver (policy/DM constraints, boot boost).
    DriverMin,
    /// Ceiling owned by the driver (online/offline, boot boost).
    DriverMax,
    /// Floor owned by the user control plane.
    UserMin,
    /// Ceiling owned by the user control plane.
    UserMax,
    /// Ceiling owned by thermal/AFM protection.
    ThermalMax,
}

impl RequestKind {
    /// Whether this request constrains the window from below.
    #[must_use]
    pub fn is_min(self) -> bool {
        matches!(self, RequestKind::DriverMin | RequestKind::UserMin)
    }
}

/// A resolved `[min, max]` frequency window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Tightest aggregated floor.
    pub min: Khz,
    /// Tightest aggregated ceiling.
    pub max: Khz,
}

/// Errors from constraint-set operations.
#[derive(Debug, Snafu)]
pub enum QosError {
    /// The initial value of a new request lies outside the domain's
    /// hardware capability bounds.
    #[snafu(display("request value {value} kHz outside [{min}, {max}] kHz"))]
    ValueOutOfBounds {
        /// Rejected value.
        value: Khz,
        /// Domain capability floor.
        min: Khz,
        /// Domain capability ceiling.
        max: Khz,
    },
    /// A request of this kind is already registered.
    #[snafu(display("{kind:?} request already registered"))]
    AlreadyRegistered {
        /// The duplicated kind.
        kind: RequestKind,
    },
    /// No request of this kind is registered.
    #[snafu(display("{kind:?} request not registered"))]
    NotRegistered {
        /// The missing kind.
        kind: RequestKind,
    },
}

/// The set of min/max requests owned by one domain.
///
/// The effective window is `max(all mins)` / `min(all maxes)`. When the two
/// sides cross, the min side yields: the window reports `min == max`. The
/// stored request values keep what their owners asked for, so releasing the
/// tighter side restores the wider window without replaying updates.
#[derive(Debug)]
pub struct ConstraintSet {
    floor: Khz,
    ceiling: Khz,
    requests: HashMap<RequestKind, Khz>,
}

impl ConstraintSet {
    /// Create an empty set for a domain with capability bounds
    /// `[floor, ceiling]`.
    #[must_use]
    pub fn new(floor: Khz, ceiling: Khz) -> Self {
        ConstraintSet {
            floor,
            ceiling,
            requests: HashMap::new(),
        }
    }

    /// Register a new request with its initial value.
    ///
    /// # Errors
    /// [`QosError::ValueOutOfBounds`] if `value` is outside the capability
    /// bounds, [`QosError::AlreadyRegistered`] on a duplicate kind.
    pub fn add(&mut self, kind: RequestKind, value: Khz) -> Result<(), QosError> {
        ensure!(
            (self.floor..=self.ceiling).contains(&value),
            ValueOutOfBoundsSnafu {
                value,
                min: self.floor,
                max: self.ceiling,
            }
        );
        ensure!(
            !self.requests.contains_key(&kind),
            AlreadyRegisteredSnafu { kind }
        );
        self.requests.insert(kind, value);
        Ok(())
    }

    /// Change one request's value and return the recomputed window.
    ///
    /// The value is clamped into the capability bounds; a resulting inverted
    /// window is resolved by the window computation (min yields), never
    /// rejected.
    ///
    /// # Errors
    /// [`QosError::NotRegistered`] if the request was never added.
    pub fn update(&mut self, kind: RequestKind, value: Khz) -> Result<Window, QosError> {
        let slot = self
            .requests
            .get_mut(&kind)
            .ok_or(QosError::NotRegistered { kind })?;
        *slot = value.clamp(self.floor, self.ceiling);
        Ok(self.window())
    }

    /// Remove a request (policy teardown).
    ///
    /// # Errors
    /// [`QosError::NotRegistered`] if the request was never added.
    pub fn remove(&mut self, kind: RequestKind) -> Result<(), QosError> {
        self.requests
            .remove(&kind)
            .map(|_| ())
            .ok_or(QosError::NotRegistered { kind })
    }

    /// The current value of one request, if registered.
    #[must_use]
    pub fn value(&self, kind: RequestKind) -> Option<Khz> {
        self.requests.get(&kind).copied()
    }

    /// The resolved window: tightest floor and ceiling over all requests,
    /// with the floor yielding when the sides cross.
    #[must_use]
    pub fn window(&self) -> Window {
        let mut min = self.floor;
        let mut max = self.ceiling;
        for (kind, &value) in &self.requests {
            if kind.is_min() {
                min = min.max(value);
            } else {
                max = max.min(value);
            }
        }
        Window {
            min: min.min(max),
            max,
        }
    }
}

//! The scaling engine: takes a domain from its current frequency to a
//! resolved target through the calibration layer, with transition
//! notifications and trace-ring records on every edge.

use snafu::Snafu;

#[cfg(test)]
use mockall::automock;

use crate::config::DomainId;
use crate::domain::Domain;
use crate::freq::{Khz, Relation};
use crate::platform::{CalError, Calibration, Clock, ClusterPower};
use crate::snapshot::{FreqEdge, Snapshot};

/// Largest drift tolerated between the tracked frequency and the rate the
/// hardware reports before the domain is declared inconsistent.
pub const DRIFT_TOLERANCE_KHZ: Khz = 10_000;

/// Observer for transition begin/end edges (governor statistics, thermal).
///
/// `end` fires exactly once for every `begin`, on the failure path too.
#[cfg_attr(test, automock)]
pub trait TransitionNotifier: Send + Sync {
    /// A transition from `old` to `new` is about to start.
    fn begin(&self, domain: DomainId, old: Khz, new: Khz);

    /// The transition finished; `failed` means the hardware kept `old`.
    fn end(&self, domain: DomainId, old: Khz, new: Khz, failed: bool);
}

/// Errors from a scaling request.
#[derive(Debug, Snafu)]
pub enum ScaleError {
    /// The domain is disabled or was taken out of service by a fault.
    #[snafu(display("domain {domain} not accepting frequency requests"))]
    DomainDisabled {
        /// Refusing domain.
        domain: DomainId,
    },
    /// No table entry satisfies the requested target and relation.
    #[snafu(display("domain {domain}: no valid frequency for {requested} kHz"))]
    NoValidFrequency {
        /// Refusing domain.
        domain: DomainId,
        /// The unresolvable target.
        requested: Khz,
    },
    /// The calibration layer refused the rate change; the hardware stays at
    /// the old rate and so does the tracked value.
    #[snafu(display("domain {domain}: rate change {old} -> {attempted} kHz failed"))]
    HardwareWriteFailed {
        /// Failing domain.
        domain: DomainId,
        /// Rate before the attempt, still in effect.
        old: Khz,
        /// Rate the engine tried to set.
        attempted: Khz,
        /// Calibration-layer failure.
        source: CalError,
    },
    /// Tracked and measured frequency disagree beyond tolerance. The domain
    /// has been taken out of service.
    #[snafu(display(
        "domain {domain}: tracked {tracked} kHz but hardware reports {measured} kHz"
    ))]
    ConsistencyFault {
        /// Faulted domain.
        domain: DomainId,
        /// What the engine believed the rate was.
        tracked: Khz,
        /// What the hardware reported.
        measured: Khz,
    },
}

impl<C: Calibration, P: ClusterPower> Domain<C, P> {
    /// Scale the domain to `target` resolved per `relation`.
    ///
    /// The resolved frequency is additionally capped at the thermal clip
    /// ceiling. Reaching the frequency the domain already runs at is a no-op
    /// that touches neither hardware nor notifiers. Returns the frequency the
    /// domain runs at afterwards.
    ///
    /// Holds the domain mutex for the whole transition; concurrent requests
    /// serialize here.
    ///
    /// # Errors
    /// See [`ScaleError`]. After [`ScaleError::ConsistencyFault`] the domain
    /// is permanently disabled; after
    /// [`ScaleError::HardwareWriteFailed`] it keeps running at the old rate.
    pub fn scale<N: TransitionNotifier, K: Clock>(
        &self,
        target: Khz,
        relation: Relation,
        notifier: &N,
        snapshot: &Snapshot<K>,
    ) -> Result<Khz, ScaleError> {
        let mut state = self.state.lock();
        if !state.enabled || state.faulted {
            return Err(ScaleError::DomainDisabled { domain: self.id() });
        }

        let resolved = self
            .table()
            .resolve(target, relation)
            .ok_or(ScaleError::NoValidFrequency {
                domain: self.id(),
                requested: target,
            })?;
        let resolved = resolved.min(state.clipped);

        let old = state.current;
        if resolved == old {
            return Ok(old);
        }

        // Catch silent divergence before building on a stale tracked value.
        let measured = self.calibration().current_rate();
        if measured != 0 && old.abs_diff(measured) > DRIFT_TOLERANCE_KHZ {
            state.faulted = true;
            state.enabled = false;
            log::error!(
                "domain {}: tracked {old} kHz but hardware reports {measured} kHz, disabling",
                self.id()
            );
            snapshot.record(self.id(), old, measured, FreqEdge::Failed);
            return Err(ScaleError::ConsistencyFault {
                domain: self.id(),
                tracked: old,
                measured,
            });
        }

        notifier.begin(self.id(), old, resolved);
        snapshot.record(self.id(), old, resolved, FreqEdge::Enter);

        let awake_cpu = if self.need_awake() {
            self.online_cpus().first()
        } else {
            None
        };
        if let Some(cpu) = awake_cpu {
            self.power().hold(cpu);
        }
        let result = self.calibration().set_rate(resolved);
        if let Some(cpu) = awake_cpu {
            self.power().release(cpu);
        }

        match result {
            Ok(()) => {
                state.current = resolved;
                snapshot.record(self.id(), old, resolved, FreqEdge::Exit);
                notifier.end(self.id(), old, resolved, false);
                log::debug!("domain {}: {old} -> {resolved} kHz", self.id());
                Ok(resolved)
            }
            Err(source) => {
                snapshot.record(self.id(), old, resolved, FreqEdge::Failed);
                notifier.end(self.id(), old, resolved, true);
                log::error!(
                    "domain {}: rate change {old} -> {resolved} kHz failed",
                    self.id()
                );
                Err(ScaleError::HardwareWriteFailed {
                    domain: self.id(),
                    old,
                    attempted: resolved,
                    source,
                })
            }
        }
    }

    /// Update the thermal clip ceiling, snapped down onto the table, and
    /// return the snapped value.
    pub fn set_clipped(&self, ceiling: Khz) -> Khz {
        let snapped = self
            .table()
            .snap_down(ceiling.clamp(self.min_freq(), self.max_freq()));
        self.state.lock().clipped = snapped;
        snapped
    }
}

#[cfg(test)]
mod tests {
    use mockall::Sequence;

    use crate::domain::tests::{test_config, test_domain};
    use crate::freq::Relation;
    use crate::platform::{MockCalibration, MockClock, MockClusterPower};

    use super::*;

    fn quiet_notifier() -> MockTransitionNotifier {
        let mut n = MockTransitionNotifier::new();
        n.expect_begin().return_const(());
        n.expect_end().return_const(());
        n
    }

    fn snap() -> Snapshot<MockClock> {
        let mut clock = MockClock::new();
        clock.expect_now_ms().return_const(0u64);
        Snapshot::new(clock, 32)
    }

    #[test]
    fn successful_scale_pairs_begin_and_end() {
        let snapshot = snap();
        let mut seq = Sequence::new();
        let mut notifier = MockTransitionNotifier::new();
        notifier
            .expect_begin()
            .withf(|dom, old, new| *dom == 0 && *old == 800 && *new == 1600)
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        notifier
            .expect_end()
            .withf(|dom, old, new, failed| *dom == 0 && *old == 800 && *new == 1600 && !failed)
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let mut cal = crate::domain::tests::test_cal(800);
        cal.expect_set_rate().times(1).returning(|_| Ok(()));
        let d = crate::domain::Domain::new(&test_config(0, &[0, 1]), cal, MockClusterPower::new())
            .expect("build domain");
        assert_eq!(
            d.scale(1700, Relation::Highest, &notifier, &snapshot).unwrap(),
            1600
        );
        assert_eq!(d.current(), 1600);

        let edges: alloc::vec::Vec<_> = snapshot.events().iter().map(|e| e.edge).collect();
        assert_eq!(edges, alloc::vec![FreqEdge::Enter, FreqEdge::Exit]);
    }

    #[test]
    fn repeated_target_writes_hardware_once() {
        let mut cal = crate::domain::tests::test_cal(800);
        cal.expect_set_rate().times(1).returning(|_| Ok(()));
        let d = crate::domain::Domain::new(&test_config(0, &[0]), cal, MockClusterPower::new())
            .expect("build domain");
        let snapshot = snap();
        let notifier = quiet_notifier();
        for _ in 0..5 {
            assert_eq!(
                d.scale(1200, Relation::Highest, &notifier, &snapshot).unwrap(),
                1200
            );
        }
    }

    #[test]
    fn idempotent_request_skips_notifiers_entirely() {
        let d = test_domain(0, &[0]);
        let snapshot = snap();
        // an un-programmed mock panics on any call
        let notifier = MockTransitionNotifier::new();
        assert_eq!(
            d.scale(800, Relation::Highest, &notifier, &snapshot).unwrap(),
            800
        );
        assert!(snapshot.is_empty());
    }

    #[test]
    fn clip_caps_the_resolved_target() {
        let mut cal = crate::domain::tests::test_cal(800);
        cal.expect_set_rate().times(1).returning(|_| Ok(()));
        let d = crate::domain::Domain::new(&test_config(0, &[0]), cal, MockClusterPower::new())
            .expect("build domain");
        assert_eq!(d.set_clipped(1300), 1200);
        let snapshot = snap();
        let notifier = quiet_notifier();
        assert_eq!(
            d.scale(2000, Relation::Highest, &notifier, &snapshot).unwrap(),
            1200
        );
    }

    #[test]
    fn write_failure_keeps_tracked_value_and_ends_failed() {
        let mut cal = crate::domain::tests::test_cal(800);
        cal.expect_set_rate()
            .times(1)
            .returning(|_| Err(CalError::Rejected { code: -5 }));
        let d = crate::domain::Domain::new(&test_config(0, &[0]), cal, MockClusterPower::new())
            .expect("build domain");
        let snapshot = snap();
        let mut notifier = MockTransitionNotifier::new();
        notifier.expect_begin().times(1).return_const(());
        notifier
            .expect_end()
            .withf(|_, _, _, failed| *failed)
            .times(1)
            .return_const(());
        assert!(matches!(
            d.scale(1200, Relation::Highest, &notifier, &snapshot),
            Err(ScaleError::HardwareWriteFailed {
                old: 800,
                attempted: 1200,
                ..
            })
        ));
        assert_eq!(d.current(), 800);
        assert_eq!(snapshot.events().last().map(|e| e.edge), Some(FreqEdge::Failed));
        // the domain is still usable
        assert!(d.enabled());
    }

    #[test]
    fn drift_beyond_tolerance_faults_the_domain() {
        let mut cal = MockCalibration::new();
        cal.expect_min_rate().return_const(400u32);
        cal.expect_max_rate().return_const(2000u32);
        cal.expect_boot_rate().return_const(800u32);
        cal.expect_resume_rate().return_const(800u32);
        let mut reads = 0u32;
        cal.expect_current_rate().returning(move || {
            reads += 1;
            // init read says 800, the pre-scale check reads way off
            if reads == 1 {
                800
            } else {
                1600
            }
        });
        let d = crate::domain::Domain::new(&test_config(0, &[0]), cal, MockClusterPower::new())
            .expect("build domain");
        let snapshot = snap();
        let notifier = MockTransitionNotifier::new();
        assert!(matches!(
            d.scale(1200, Relation::Highest, &notifier, &snapshot),
            Err(ScaleError::ConsistencyFault {
                tracked: 800,
                measured: 1600,
                ..
            })
        ));
        assert!(!d.enabled());
        assert!(matches!(
            d.scale(1200, Relation::Highest, &notifier, &snapshot),
            Err(ScaleError::DomainDisabled { domain: 0 })
        ));
    }

    #[test]
    fn drift_within_tolerance_is_accepted() {
        let mut cal = MockCalibration::new();
        cal.expect_min_rate().return_const(400u32);
        cal.expect_max_rate().return_const(2000u32);
        cal.expect_boot_rate().return_const(800u32);
        cal.expect_resume_rate().return_const(800u32);
        let mut reads = 0u32;
        cal.expect_current_rate().returning(move || {
            reads += 1;
            if reads == 1 {
                800
            } else {
                805
            }
        });
        cal.expect_set_rate().times(1).returning(|_| Ok(()));
        let d = crate::domain::Domain::new(&test_config(0, &[0]), cal, MockClusterPower::new())
            .expect("build domain");
        let snapshot = snap();
        let notifier = quiet_notifier();
        assert_eq!(
            d.scale(1200, Relation::Highest, &notifier, &snapshot).unwrap(),
            1200
        );
    }

    #[test]
    fn unresolvable_target_is_rejected() {
        let d = test_domain(0, &[0]);
        let snapshot = snap();
        let notifier = MockTransitionNotifier::new();
        assert!(matches!(
            d.scale(300, Relation::Highest, &notifier, &snapshot),
            Err(ScaleError::NoValidFrequency { requested: 300, .. })
        ));
    }

    #[test]
    fn awake_domain_brackets_the_write_with_power_holds() {
        let mut seq = Sequence::new();
        let mut power = MockClusterPower::new();
        power
            .expect_hold()
            .withf(|cpu| *cpu == 4)
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        power
            .expect_release()
            .withf(|cpu| *cpu == 4)
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        let mut cal = crate::domain::tests::test_cal(800);
        cal.expect_set_rate().times(1).returning(|_| Ok(()));
        let mut cfg = test_config(1, &[4, 5, 6, 7]);
        cfg.need_awake = true;
        let d = crate::domain::Domain::new(&cfg, cal, power).expect("build domain");
        let snapshot = snap();
        let notifier = quiet_notifier();
        d.scale(1600, Relation::Highest, &notifier, &snapshot).unwrap();
    }
}

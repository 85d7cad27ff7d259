//! Post-mortem trace ring for frequency transitions.
//!
//! A fixed-capacity ring of timestamped transition edges, written from the
//! scaling engine and the AFM work paths. Crash tooling dumps it raw; tests
//! read it back through [`Snapshot::events`].

use alloc::vec::Vec;
use spin::Mutex;

use crate::config::DomainId;
use crate::freq::Khz;
use crate::platform::Clock;

/// Which edge of a transition an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreqEdge {
    /// Transition started.
    Enter,
    /// Transition committed.
    Exit,
    /// Transition aborted, hardware left at the old rate.
    Failed,
}

/// One recorded transition edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreqEvent {
    /// Monotonic timestamp.
    pub time_ms: u64,
    /// Domain the transition belongs to.
    pub domain: DomainId,
    /// Rate before the transition.
    pub old: Khz,
    /// Requested rate.
    pub new: Khz,
    /// Edge kind.
    pub edge: FreqEdge,
}

struct Ring {
    events: Vec<FreqEvent>,
    head: usize,
    capacity: usize,
}

/// The transition trace ring.
pub struct Snapshot<K> {
    clock: K,
    ring: Mutex<Ring>,
}

impl<K: Clock> Snapshot<K> {
    /// Create a ring holding the newest `capacity` events.
    pub fn new(clock: K, capacity: usize) -> Self {
        Snapshot {
            clock,
            ring: Mutex::new(Ring {
                events: Vec::with_capacity(capacity),
                head: 0,
                capacity: capacity.max(1),
            }),
        }
    }

    /// Append one event, evicting the oldest once full.
    pub fn record(&self, domain: DomainId, old: Khz, new: Khz, edge: FreqEdge) {
        let event = FreqEvent {
            time_ms: self.clock.now_ms(),
            domain,
            old,
            new,
            edge,
        };
        let mut ring = self.ring.lock();
        if ring.events.len() < ring.capacity {
            ring.events.push(event);
        } else {
            let head = ring.head;
            ring.events[head] = event;
            ring.head = (head + 1) % ring.capacity;
        }
    }

    /// The recorded events, oldest first.
    pub fn events(&self) -> Vec<FreqEvent> {
        let ring = self.ring.lock();
        let mut out = Vec::with_capacity(ring.events.len());
        out.extend_from_slice(&ring.events[ring.head..]);
        out.extend_from_slice(&ring.events[..ring.head]);
        out
    }

    /// Number of events currently held.
    pub fn len(&self) -> usize {
        self.ring.lock().events.len()
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.ring.lock().events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::platform::MockClock;

    use super::*;

    fn ticking_clock() -> MockClock {
        let mut clock = MockClock::new();
        let mut t = 0u64;
        clock.expect_now_ms().returning(move || {
            t += 1;
            t
        });
        clock
    }

    #[test]
    fn keeps_newest_events_when_full() {
        let snap = Snapshot::new(ticking_clock(), 3);
        for i in 0..5u32 {
            snap.record(0, i, i + 1, FreqEdge::Exit);
        }
        let events = snap.events();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events.iter().map(|e| e.old).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        // timestamps stay monotonic across the wrap
        assert!(events.windows(2).all(|w| w[0].time_ms < w[1].time_ms));
    }

    #[test]
    fn partial_fill_reads_in_order() {
        let snap = Snapshot::new(ticking_clock(), 8);
        snap.record(1, 800, 1000, FreqEdge::Enter);
        snap.record(1, 800, 1000, FreqEdge::Failed);
        let events = snap.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].edge, FreqEdge::Enter);
        assert_eq!(events[1].edge, FreqEdge::Failed);
        assert_eq!(events[1].new, 1000);
    }
}

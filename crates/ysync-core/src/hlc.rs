//! Hybrid Logical Clock (HLC) implementation for replica timestamps.
//!
//! An HLC combines:
//! - Physical wall-clock time (milliseconds)
//! - Logical counter for events at the same physical time
//! - Node ID for deterministic tiebreaking
//!
//! Ordering is lexicographic on `(physical_time, logical_counter, node_id)`,
//! so any two stamps compare as exactly one of `<`, `==`, `>`.
//!
//! # References
//!
//! Kulkarni, Demirbas, et al. "Logical Physical Clocks and Consistent Snapshots
//! in Globally Distributed Databases" (2014)

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Identifier of a replica (client or server).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node ID from any string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random node ID (UUID v4).
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A hybrid logical timestamp. Immutable value type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hlc {
    /// Physical wall-clock time in milliseconds since UNIX epoch
    pub physical_time: u64,
    /// Logical counter for events at the same physical time
    pub logical_counter: u32,
    /// Node that produced the timestamp
    pub node_id: NodeId,
}

impl Hlc {
    /// Create a timestamp from its parts.
    #[must_use]
    pub fn new(physical_time: u64, logical_counter: u32, node_id: NodeId) -> Self {
        Self {
            physical_time,
            logical_counter,
            node_id,
        }
    }

    /// Create a timestamp at the current wall-clock time.
    #[must_use]
    pub fn now(node_id: NodeId) -> Self {
        Self::new(current_time_ms(), 0, node_id)
    }

    /// Advance for a local event using the current wall clock.
    #[must_use]
    pub fn increment(&self) -> Self {
        self.increment_at(current_time_ms())
    }

    /// Advance for a local event given an explicit wall-clock reading.
    #[must_use]
    pub fn increment_at(&self, wall_ms: u64) -> Self {
        if wall_ms > self.physical_time {
            Self::new(wall_ms, 0, self.node_id.clone())
        } else {
            Self::new(
                self.physical_time,
                self.logical_counter.saturating_add(1),
                self.node_id.clone(),
            )
        }
    }

    /// Merge a remote timestamp using the current wall clock.
    ///
    /// The result keeps the local node ID and is strictly greater than both
    /// `self` and `remote` in `(physical_time, logical_counter)`.
    #[must_use]
    pub fn receive_event(&self, remote: &Hlc) -> Self {
        self.receive_event_at(remote, current_time_ms())
    }

    /// Merge a remote timestamp given an explicit wall-clock reading.
    #[must_use]
    pub fn receive_event_at(&self, remote: &Hlc, wall_ms: u64) -> Self {
        let physical = wall_ms.max(self.physical_time).max(remote.physical_time);
        let local_match = physical == self.physical_time;
        let remote_match = physical == remote.physical_time;

        let logical = match (local_match, remote_match) {
            (true, true) => self
                .logical_counter
                .max(remote.logical_counter)
                .saturating_add(1),
            (false, true) => remote.logical_counter.saturating_add(1),
            (true, false) => self.logical_counter.saturating_add(1),
            (false, false) => 0,
        };

        Self::new(physical, logical, self.node_id.clone())
    }

    /// The stamp `n` logical steps after this one, on the same node.
    ///
    /// Used to address individual units inside a batched run.
    #[must_use]
    pub fn offset(&self, n: u32) -> Self {
        Self::new(
            self.physical_time,
            self.logical_counter.saturating_add(n),
            self.node_id.clone(),
        )
    }

    /// Strictly ordered before `other`.
    #[must_use]
    pub fn happens_before(&self, other: &Hlc) -> bool {
        self < other
    }

    /// Strictly ordered after `other`.
    #[must_use]
    pub fn happens_after(&self, other: &Hlc) -> bool {
        self > other
    }
}

impl Ord for Hlc {
    fn cmp(&self, other: &Self) -> Ordering {
        // First compare physical time
        match self.physical_time.cmp(&other.physical_time) {
            Ordering::Equal => {}
            ord => return ord,
        }
        // Then logical counter
        match self.logical_counter.cmp(&other.logical_counter) {
            Ordering::Equal => {}
            ord => return ord,
        }
        // Finally node ID for deterministic tiebreaking
        self.node_id.cmp(&other.node_id)
    }
}

impl PartialOrd for Hlc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}@{}",
            self.physical_time, self.logical_counter, self.node_id
        )
    }
}

/// Hybrid Logical Clock state machine owned by one replica.
#[derive(Debug, Clone)]
pub struct Clock {
    /// Latest timestamp issued or observed
    last: Hlc,
}

impl Clock {
    /// Create a new clock for the given node.
    #[must_use]
    pub fn new(node_id: NodeId) -> Self {
        Self {
            last: Hlc::now(node_id),
        }
    }

    /// Resume a clock from a previously observed timestamp.
    #[must_use]
    pub fn from_hlc(last: Hlc) -> Self {
        Self { last }
    }

    /// Get the node ID for this clock.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.last.node_id
    }

    /// Generate a new timestamp for a local event.
    ///
    /// Guarantees the returned timestamp is greater than any previously
    /// generated or received timestamp.
    pub fn tick(&mut self) -> Hlc {
        self.last = self.last.increment();
        self.last.clone()
    }

    /// Generate a timestamp and reserve `len` consecutive logical slots.
    ///
    /// Returns the first stamp; `first.offset(i)` for `i < len` are all owned
    /// by the caller and the clock resumes after the last of them.
    pub fn tick_span(&mut self, len: u32) -> Hlc {
        let first = self.tick();
        if len > 1 {
            self.last = first.offset(len - 1);
        }
        first
    }

    /// Update the clock upon receiving a remote timestamp.
    ///
    /// Ensures the local clock advances past the received timestamp.
    pub fn update(&mut self, received: &Hlc) {
        self.last = self.last.receive_event(received);
    }

    /// Get the current timestamp without advancing the clock.
    #[must_use]
    pub fn current(&self) -> &Hlc {
        &self.last
    }
}

/// Get current wall clock time in milliseconds since UNIX epoch.
fn current_time_ms() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis());
    u64::try_from(millis).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stamp(physical: u64, logical: u32, node: &str) -> Hlc {
        Hlc::new(physical, logical, NodeId::from(node))
    }

    #[test]
    fn clock_monotonic() {
        let mut clock = Clock::new(NodeId::from("a"));

        let t1 = clock.tick();
        let t2 = clock.tick();
        let t3 = clock.tick();

        assert!(t1 < t2);
        assert!(t2 < t3);
    }

    #[test]
    fn clock_update_advances() {
        let mut clock_a = Clock::new(NodeId::from("a"));
        let mut clock_b = Clock::new(NodeId::from("b"));

        let t_a = clock_a.tick();
        clock_b.update(&t_a);

        let t_b = clock_b.tick();
        assert!(t_b > t_a);
        assert_eq!(t_b.node_id, NodeId::from("b"));
    }

    #[test]
    fn tick_span_reserves_slots() {
        let mut clock = Clock::from_hlc(stamp(u64::MAX - 1, 0, "a"));
        let first = clock.tick_span(5);
        assert_eq!(clock.current(), &first.offset(4));

        let next = clock.tick();
        assert!(next > first.offset(4));
    }

    #[test]
    fn increment_uses_wall_clock_when_ahead() {
        let hlc = stamp(100, 7, "a");
        assert_eq!(hlc.increment_at(200), stamp(200, 0, "a"));
        assert_eq!(hlc.increment_at(100), stamp(100, 8, "a"));
        assert_eq!(hlc.increment_at(50), stamp(100, 8, "a"));
    }

    #[test]
    fn receive_event_cases() {
        let local = stamp(100, 3, "a");

        // Both physical times equal the max
        assert_eq!(
            local.receive_event_at(&stamp(100, 9, "b"), 10),
            stamp(100, 10, "a")
        );
        // Remote ahead
        assert_eq!(
            local.receive_event_at(&stamp(150, 4, "b"), 10),
            stamp(150, 5, "a")
        );
        // Local ahead
        assert_eq!(
            local.receive_event_at(&stamp(90, 40, "b"), 10),
            stamp(100, 4, "a")
        );
        // Wall clock ahead of both
        assert_eq!(
            local.receive_event_at(&stamp(90, 40, "b"), 500),
            stamp(500, 0, "a")
        );
    }

    #[test]
    fn ordering_tiebreaker() {
        let t1 = stamp(1000, 0, "node-1");
        let t2 = stamp(1000, 0, "node-2");

        // Same time and counter, so node ID breaks tie
        assert!(t1 < t2);
        assert!(t1.happens_before(&t2));
        assert!(t2.happens_after(&t1));
    }

    #[test]
    fn json_shape() {
        let json = serde_json::to_value(stamp(5, 1, "n")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"physicalTime": 5, "logicalCounter": 1, "nodeId": "n"})
        );
    }

    fn arb_hlc() -> impl Strategy<Value = Hlc> {
        (0u64..4, 0u32..4, "[abc]").prop_map(|(p, l, n)| Hlc::new(p, l, NodeId::from(n)))
    }

    proptest! {
        #[test]
        fn total_order_trichotomy(a in arb_hlc(), b in arb_hlc()) {
            let outcomes = [a < b, a == b, a > b];
            prop_assert_eq!(outcomes.iter().filter(|x| **x).count(), 1);
            prop_assert_eq!(a.happens_before(&b), b.happens_after(&a));
        }

        #[test]
        fn total_order_transitive(a in arb_hlc(), b in arb_hlc(), c in arb_hlc()) {
            if a <= b && b <= c {
                prop_assert!(a <= c);
            }
        }

        #[test]
        fn receive_event_dominates(a in arb_hlc(), b in arb_hlc(), wall in 0u64..6) {
            let merged = a.receive_event_at(&b, wall);
            prop_assert!((merged.physical_time, merged.logical_counter)
                > (a.physical_time, a.logical_counter));
            prop_assert!((merged.physical_time, merged.logical_counter)
                > (b.physical_time, b.logical_counter));
        }
    }
}

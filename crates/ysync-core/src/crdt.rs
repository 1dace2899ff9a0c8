//! State-based counter CRDTs.
//!
//! Counters merge by per-node maximum, which makes `merge` commutative,
//! associative, and idempotent without any clock.

use crate::hlc::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A grow-only counter.
///
/// Each node owns one slot that only ever increases. The value is the sum of
/// all slots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GCounter {
    /// Node ID -> that node's total
    counts: BTreeMap<NodeId, u64>,
}

impl GCounter {
    /// Create a new empty counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `amount` to the slot of `node_id`. Returns the slot's new total.
    pub fn increment(&mut self, node_id: &NodeId, amount: u64) -> u64 {
        let slot = self.counts.entry(node_id.clone()).or_insert(0);
        *slot = slot.saturating_add(amount);
        *slot
    }

    /// Sum of all slots.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.counts
            .values()
            .fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    /// Total contributed by one node.
    #[must_use]
    pub fn node_value(&self, node_id: &NodeId) -> u64 {
        self.counts.get(node_id).copied().unwrap_or(0)
    }

    /// Raise one node's slot to at least `total`.
    pub fn observe(&mut self, node_id: &NodeId, total: u64) {
        let slot = self.counts.entry(node_id.clone()).or_insert(0);
        *slot = (*slot).max(total);
    }

    /// Merge with another counter: per-node max.
    ///
    /// The value never decreases as a result.
    pub fn merge(&mut self, other: &Self) {
        for (node_id, &total) in &other.counts {
            self.observe(node_id, total);
        }
    }

    /// Entries where `self` is ahead of `other`.
    #[must_use]
    pub fn delta_since(&self, other: &Self) -> GCounter {
        let counts = self
            .counts
            .iter()
            .filter(|&(node_id, &total)| total > other.node_value(node_id))
            .map(|(node_id, &total)| (node_id.clone(), total))
            .collect();
        GCounter { counts }
    }

    /// Iterate over `(node, total)` slots.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, u64)> {
        self.counts.iter().map(|(k, v)| (k, *v))
    }
}

/// A counter supporting both increments and decrements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnCounter {
    /// Increments per node
    positive: GCounter,
    /// Decrements per node
    negative: GCounter,
}

impl PnCounter {
    /// Create a new zeroed counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increase the value. Returns the node's new positive total.
    pub fn increment(&mut self, node_id: &NodeId, amount: u64) -> u64 {
        self.positive.increment(node_id, amount)
    }

    /// Decrease the value. Returns the node's new negative total.
    pub fn decrement(&mut self, node_id: &NodeId, amount: u64) -> u64 {
        self.negative.increment(node_id, amount)
    }

    /// Route a signed amount to the matching inner counter.
    pub fn add(&mut self, node_id: &NodeId, amount: i64) {
        if amount >= 0 {
            self.increment(node_id, amount.unsigned_abs());
        } else {
            self.decrement(node_id, amount.unsigned_abs());
        }
    }

    /// Positive total minus negative total.
    #[must_use]
    pub fn value(&self) -> i64 {
        let diff = i128::from(self.positive.value()) - i128::from(self.negative.value());
        i64::try_from(diff).unwrap_or(if diff > 0 { i64::MAX } else { i64::MIN })
    }

    /// `(positive, negative)` totals of one node.
    #[must_use]
    pub fn node_totals(&self, node_id: &NodeId) -> (u64, u64) {
        (
            self.positive.node_value(node_id),
            self.negative.node_value(node_id),
        )
    }

    /// Raise one node's totals to at least the given values.
    pub fn observe(&mut self, node_id: &NodeId, positive: u64, negative: u64) {
        self.positive.observe(node_id, positive);
        self.negative.observe(node_id, negative);
    }

    /// Merge both inner counters independently.
    pub fn merge(&mut self, other: &Self) {
        self.positive.merge(&other.positive);
        self.negative.merge(&other.negative);
    }

    /// The increment counter.
    #[must_use]
    pub fn positive(&self) -> &GCounter {
        &self.positive
    }

    /// The decrement counter.
    #[must_use]
    pub fn negative(&self) -> &GCounter {
        &self.negative
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node(n: u8) -> NodeId {
        NodeId::new(n.to_string())
    }

    #[test]
    fn gcounter_merge_sums_nodes() {
        let mut c1 = GCounter::new();
        let mut c2 = GCounter::new();

        c1.increment(&node(1), 5);
        c2.increment(&node(2), 3);

        c1.merge(&c2);
        assert_eq!(c1.value(), 8);

        // Merging again changes nothing
        c1.merge(&c2);
        assert_eq!(c1.value(), 8);
    }

    #[test]
    fn gcounter_delta_since() {
        let mut a = GCounter::new();
        a.increment(&node(1), 4);
        a.increment(&node(2), 1);

        let mut b = GCounter::new();
        b.increment(&node(2), 1);

        let delta = a.delta_since(&b);
        assert_eq!(delta.node_value(&node(1)), 4);
        assert_eq!(delta.node_value(&node(2)), 0);

        b.merge(&delta);
        assert_eq!(b, a);
    }

    #[test]
    fn pncounter_routes_signed_amounts() {
        let mut c = PnCounter::new();
        c.add(&node(1), 10);
        c.add(&node(1), -4);
        c.decrement(&node(2), 1);

        assert_eq!(c.value(), 5);
        assert_eq!(c.node_totals(&node(1)), (10, 4));
    }

    #[test]
    fn pncounter_merge_converges() {
        let mut a = PnCounter::new();
        let mut b = PnCounter::new();
        a.increment(&node(1), 3);
        b.decrement(&node(2), 7);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        assert_eq!(ab, ba);
        assert_eq!(ab.value(), -4);
    }

    fn arb_gcounter() -> impl Strategy<Value = GCounter> {
        prop::collection::vec((0u8..4, 0u64..100), 0..8).prop_map(|incs| {
            let mut c = GCounter::new();
            for (n, amount) in incs {
                c.increment(&node(n), amount);
            }
            c
        })
    }

    proptest! {
        #[test]
        fn gcounter_merge_laws(a in arb_gcounter(), b in arb_gcounter(), c in arb_gcounter()) {
            // Commutative
            let mut ab = a.clone();
            ab.merge(&b);
            let mut ba = b.clone();
            ba.merge(&a);
            prop_assert_eq!(&ab, &ba);

            // Idempotent
            let mut abb = ab.clone();
            abb.merge(&b);
            prop_assert_eq!(&abb, &ab);

            // Associative
            let mut ab_c = ab.clone();
            ab_c.merge(&c);
            let mut bc = b.clone();
            bc.merge(&c);
            let mut a_bc = a.clone();
            a_bc.merge(&bc);
            prop_assert_eq!(&ab_c, &a_bc);

            // Monotonic
            prop_assert!(ab.value() >= a.value());
            prop_assert!(ab.value() >= b.value());
        }
    }
}

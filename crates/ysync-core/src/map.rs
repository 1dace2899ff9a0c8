//! Last-writer-wins map shared type.
//!
//! Every `set` creates a new item tagged with the map key. For each key the
//! item with the greatest id wins; any item with a smaller id is tombstoned
//! when a larger one is integrated, regardless of arrival order. `delete`
//! tombstones only the item it observed, so a concurrent newer `set` on the
//! same key survives.

use crate::item::{Content, Id, Item, ItemSnapshot, ItemStore};
use crate::sync::HlcVector;
use std::collections::BTreeMap;

/// A replicated map from string keys to item content.
#[derive(Debug, Clone, Default)]
pub struct YMap {
    store: ItemStore,
    /// key -> arena indices of every item ever set for that key
    keys: BTreeMap<String, Vec<usize>>,
    pending_deletes: Vec<Id>,
}

impl YMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the live content for a key.
    #[must_use]
    pub fn get_content(&self, key: &str) -> Option<&Content> {
        self.live(key).map(|idx| &self.store.get(idx).content)
    }

    /// Get the live value for a key, if it holds a plain value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        match self.get_content(key)? {
            Content::Any(values) => values.first(),
            _ => None,
        }
    }

    /// Id of the live item for a key.
    #[must_use]
    pub fn live_id(&self, key: &str) -> Option<&Id> {
        self.live(key).map(|idx| &self.store.get(idx).id)
    }

    /// Check if a key has a live value.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.live(key).is_some()
    }

    /// Iterate over live entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Content)> {
        self.keys.iter().filter_map(|(key, slots)| {
            slots
                .iter()
                .map(|&idx| self.store.get(idx))
                .find(|item| !item.deleted)
                .map(|item| (key.as_str(), &item.content))
        })
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Check if the map has no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Integrate a map item (local or remote).
    ///
    /// Returns `false` if the item was already present.
    pub fn integrate(&mut self, item: Item) -> bool {
        if self.store.contains(&item.id) {
            return false;
        }
        let Some(key) = item.key.clone() else {
            tracing::warn!(id = %item.id, "Map item without key ignored");
            return false;
        };

        let id = item.id.clone();
        let idx = self.store.push(item);
        let slots = self.keys.entry(key).or_default();
        slots.push(idx);

        let superseded = slots.iter().any(|&other| self.store.get(other).id > id);
        if superseded {
            self.store.tombstone(idx);
        } else {
            for other in slots.clone() {
                if other != idx {
                    self.store.tombstone(other);
                }
            }
        }

        if !self.pending_deletes.is_empty() {
            self.retry_pending_deletes();
        }
        true
    }

    /// Tombstone the live item for a key. Returns its id.
    pub fn delete(&mut self, key: &str) -> Option<Id> {
        let idx = self.live(key)?;
        self.store.tombstone(idx);
        Some(self.store.get(idx).id.clone())
    }

    /// Tombstone a specific item by id, parking the delete if it is unknown.
    pub fn delete_id(&mut self, id: &Id) {
        match self.store.find(id) {
            Some((idx, _)) => {
                self.store.tombstone(idx);
            }
            None => self.pending_deletes.push(id.clone()),
        }
    }

    /// Every item (including tombstones) in allocation order.
    #[must_use]
    pub fn to_snapshot(&self) -> Vec<ItemSnapshot> {
        self.store.iter().map(Item::to_snapshot).collect()
    }

    /// Live entries as an owned, key-ordered map.
    #[must_use]
    pub fn entries(&self) -> BTreeMap<String, Content> {
        self.iter()
            .map(|(key, content)| (key.to_string(), content.clone()))
            .collect()
    }

    fn live(&self, key: &str) -> Option<usize> {
        self.keys
            .get(key)?
            .iter()
            .copied()
            .find(|&idx| !self.store.get(idx).deleted)
    }

    fn retry_pending_deletes(&mut self) {
        let pending = std::mem::take(&mut self.pending_deletes);
        for id in &pending {
            self.delete_id(id);
        }
    }

    /// Drop parked deletes whose targets `covered` has already seen.
    /// Returns the number dropped.
    pub fn prune_pending_deletes(&mut self, covered: &HlcVector) -> usize {
        let before = self.pending_deletes.len();
        self.pending_deletes.retain(|id| !covered.has_seen(&id.0));
        before - self.pending_deletes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::{Hlc, NodeId};
    use serde_json::json;

    fn id(physical: u64, node: &str) -> Id {
        Id::new(Hlc::new(physical, 0, NodeId::from(node)))
    }

    fn set(key: &str, value: serde_json::Value, id: Id) -> Item {
        Item::new(id, Content::Any(vec![value]), None, None, "m").with_key(key)
    }

    #[test]
    fn set_get_delete() {
        let mut map = YMap::new();
        assert!(map.integrate(set("a", json!(1), id(1, "n"))));
        assert!(map.integrate(set("a", json!(2), id(2, "n"))));

        assert_eq!(map.get("a"), Some(&json!(2)));
        assert_eq!(map.len(), 1);

        assert_eq!(map.delete("a"), Some(id(2, "n")));
        assert_eq!(map.get("a"), None);
        assert!(map.is_empty());
        assert_eq!(map.delete("a"), None);
    }

    #[test]
    fn concurrent_set_converges_to_larger_id() {
        let x = set("k", json!("x"), id(10, "a"));
        let y = set("k", json!("y"), id(10, "b"));

        let mut m1 = YMap::new();
        m1.integrate(x.clone());
        m1.integrate(y.clone());

        let mut m2 = YMap::new();
        m2.integrate(y);
        m2.integrate(x);

        assert_eq!(m1.get("k"), Some(&json!("y")));
        assert_eq!(m2.get("k"), Some(&json!("y")));
    }

    #[test]
    fn delete_does_not_remove_concurrent_newer_set() {
        let mut m1 = YMap::new();
        m1.integrate(set("k", json!(1), id(1, "a")));
        let deleted = m1.delete("k").unwrap();
        m1.integrate(set("k", json!(2), id(5, "b")));

        let mut m2 = YMap::new();
        m2.integrate(set("k", json!(1), id(1, "a")));
        m2.integrate(set("k", json!(2), id(5, "b")));
        m2.delete_id(&deleted);

        assert_eq!(m1.get("k"), Some(&json!(2)));
        assert_eq!(m2.get("k"), Some(&json!(2)));
    }

    #[test]
    fn duplicate_and_pending_delete() {
        let item = set("k", json!(1), id(1, "a"));
        let mut map = YMap::new();
        map.delete_id(&id(1, "a"));
        assert!(map.integrate(item.clone()));
        assert!(!map.integrate(item));
        assert_eq!(map.get("k"), None);
    }
}

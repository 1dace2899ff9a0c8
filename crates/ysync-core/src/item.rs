//! Struct model: identities, items, and the per-type item arena.
//!
//! Every mutation of a shared type becomes an [`Item`] addressed by an
//! HLC-stamped [`Id`]. A batched item covering `n` content units owns the
//! ids `id.offset(0) .. id.offset(n - 1)`.
//!
//! Items live in an append-only arena ([`ItemStore`]). Neighbor links are
//! arena indices and origins are ids resolved through the store's index, so
//! the graph never forms ownership cycles.

use crate::hlc::{Hlc, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Unique identifier of one content unit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub Hlc);

impl Id {
    /// Wrap an HLC.
    #[must_use]
    pub fn new(hlc: Hlc) -> Self {
        Self(hlc)
    }

    /// The node that created this unit.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.0.node_id
    }

    /// The id `n` units further into the same run.
    #[must_use]
    pub fn offset(&self, n: u32) -> Self {
        Self(self.0.offset(n))
    }

    /// The underlying timestamp.
    #[must_use]
    pub fn hlc(&self) -> &Hlc {
        &self.0
    }

    fn run_key(&self) -> (u64, u32) {
        (self.0.physical_time, self.0.logical_counter)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A contiguous span of ids created in one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    /// First id of the span
    pub start: Id,
    /// Number of units covered
    pub len: u32,
}

impl IdRange {
    /// Create a new range.
    #[must_use]
    pub fn new(start: Id, len: u32) -> Self {
        Self { start, len }
    }

    /// The id of the last unit in the range.
    #[must_use]
    pub fn last(&self) -> Id {
        self.start.offset(self.len.saturating_sub(1))
    }
}

/// The kind of a shared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeKind {
    /// Last-writer-wins map
    #[serde(rename = "map")]
    Map,
    /// Ordered sequence of values
    #[serde(rename = "array")]
    Array,
    /// Ordered sequence of characters
    #[serde(rename = "text")]
    Text,
    /// Grow-only counter
    #[serde(rename = "gcounter")]
    GCounter,
    /// Increment/decrement counter
    #[serde(rename = "pncounter")]
    PnCounter,
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeKind::Map => "map",
            TypeKind::Array => "array",
            TypeKind::Text => "text",
            TypeKind::GCounter => "gcounter",
            TypeKind::PnCounter => "pncounter",
        };
        f.write_str(name)
    }
}

/// Reference to a nested shared type registered in the same document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRef {
    /// Registry key of the nested type
    pub key: String,
    /// Kind of the nested type
    pub kind: TypeKind,
}

/// The payload carried by an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Content {
    /// A run of characters
    Text(String),
    /// A run of arbitrary JSON-like values
    Any(Vec<serde_json::Value>),
    /// A nested shared type
    Type(TypeRef),
}

impl Content {
    /// Number of content units (characters, values, or 1 for a type).
    #[must_use]
    pub fn len(&self) -> u32 {
        let len = match self {
            Content::Text(text) => text.chars().count(),
            Content::Any(values) => values.len(),
            Content::Type(_) => 1,
        };
        u32::try_from(len).unwrap_or(u32::MAX)
    }

    /// Whether the content has no units.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split off the units from `offset` onward, keeping `[0, offset)`.
    fn split_off(&mut self, offset: u32) -> Content {
        match self {
            Content::Text(text) => {
                let at = text
                    .char_indices()
                    .nth(offset as usize)
                    .map_or(text.len(), |(i, _)| i);
                Content::Text(text.split_off(at))
            }
            Content::Any(values) => Content::Any(values.split_off(offset as usize)),
            // Types are a single unit and never split.
            Content::Type(r) => Content::Type(r.clone()),
        }
    }
}

/// One causally-anchored unit of replicated state.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Id of the first unit
    pub id: Id,
    /// Id of the left neighbor at creation time
    pub origin: Option<Id>,
    /// Id of the right neighbor at creation time
    pub right_origin: Option<Id>,
    /// Registry key of the owning shared type
    pub parent: String,
    /// Map key, for items owned by a map
    pub key: Option<String>,
    /// Payload
    pub content: Content,
    /// Tombstone flag
    pub deleted: bool,
    /// Content units covered
    pub length: u32,
    /// Arena index of the left neighbor in the chain
    pub(crate) left: Option<usize>,
    /// Arena index of the right neighbor in the chain
    pub(crate) right: Option<usize>,
}

impl Item {
    /// Create an unintegrated item anchored between two neighbors.
    #[must_use]
    pub fn new(
        id: Id,
        content: Content,
        origin: Option<Id>,
        right_origin: Option<Id>,
        parent: impl Into<String>,
    ) -> Self {
        let length = content.len();
        Self {
            id,
            origin,
            right_origin,
            parent: parent.into(),
            key: None,
            content,
            deleted: false,
            length,
            left: None,
            right: None,
        }
    }

    /// Tag the item with a map key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Whether `id` addresses one of this item's units.
    #[must_use]
    pub fn contains(&self, id: &Id) -> bool {
        let start = &self.id.0;
        let probe = &id.0;
        start.node_id == probe.node_id
            && start.physical_time == probe.physical_time
            && probe.logical_counter >= start.logical_counter
            && probe.logical_counter - start.logical_counter < self.length
    }

    /// The id of the last unit.
    #[must_use]
    pub fn last_id(&self) -> Id {
        self.id.offset(self.length.saturating_sub(1))
    }

    /// Units visible to readers.
    #[must_use]
    pub fn visible_len(&self) -> u32 {
        if self.deleted {
            0
        } else {
            self.length
        }
    }

    /// Serializable view of the item.
    #[must_use]
    pub fn to_snapshot(&self) -> ItemSnapshot {
        ItemSnapshot {
            id: self.id.clone(),
            origin: self.origin.clone(),
            right_origin: self.right_origin.clone(),
            key: self.key.clone(),
            content: self.content.clone(),
            deleted: self.deleted,
        }
    }
}

/// Serializable form of an item, used in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSnapshot {
    /// Id of the first unit
    pub id: Id,
    /// Left origin
    pub origin: Option<Id>,
    /// Right origin
    pub right_origin: Option<Id>,
    /// Map key, for map items
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Payload
    pub content: Content,
    /// Tombstone flag
    pub deleted: bool,
}

impl ItemSnapshot {
    /// Rebuild an unintegrated item owned by `parent`.
    #[must_use]
    pub fn to_item(&self, parent: &str) -> Item {
        let mut item = Item::new(
            self.id.clone(),
            self.content.clone(),
            self.origin.clone(),
            self.right_origin.clone(),
            parent,
        );
        item.key = self.key.clone();
        item
    }
}

/// Append-only arena of items with an id index and a delete set.
#[derive(Debug, Clone, Default)]
pub struct ItemStore {
    items: Vec<Item>,
    /// node -> run start `(physical, logical)` -> arena index
    index: HashMap<NodeId, BTreeMap<(u64, u32), usize>>,
    /// Deleted spans per node, kept for compaction
    delete_set: HashMap<NodeId, Vec<IdRange>>,
}

impl ItemStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of arena slots (items and split fragments).
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the arena is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Borrow the item at an arena index.
    #[must_use]
    pub fn get(&self, idx: usize) -> &Item {
        &self.items[idx]
    }

    pub(crate) fn get_mut(&mut self, idx: usize) -> &mut Item {
        &mut self.items[idx]
    }

    /// Iterate over all arena slots in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = &Item> {
        self.items.iter()
    }

    /// Add an item to the arena and index it. Returns its arena index.
    pub fn push(&mut self, item: Item) -> usize {
        let idx = self.items.len();
        self.index
            .entry(item.id.node_id().clone())
            .or_default()
            .insert(item.id.run_key(), idx);
        self.items.push(item);
        idx
    }

    /// Resolve an id to `(arena index, offset within the item)`.
    #[must_use]
    pub fn find(&self, id: &Id) -> Option<(usize, u32)> {
        let runs = self.index.get(id.node_id())?;
        let (_, &idx) = runs.range(..=id.run_key()).next_back()?;
        let item = &self.items[idx];
        if item.contains(id) {
            Some((idx, id.0.logical_counter - item.id.0.logical_counter))
        } else {
            None
        }
    }

    /// Whether any item covers `id`.
    #[must_use]
    pub fn contains(&self, id: &Id) -> bool {
        self.find(id).is_some()
    }

    /// Split the item at `idx` so that it keeps `[0, offset)`.
    ///
    /// The new right fragment is linked directly after the original in the
    /// chain and its origin is the last unit of the left fragment. Returns
    /// the arena index of the right fragment.
    pub fn split(&mut self, idx: usize, offset: u32) -> usize {
        debug_assert!(offset > 0 && offset < self.items[idx].length);

        let left = &mut self.items[idx];
        let content = left.content.split_off(offset);
        let right = Item {
            id: left.id.offset(offset),
            origin: Some(left.id.offset(offset - 1)),
            right_origin: left.right_origin.clone(),
            parent: left.parent.clone(),
            key: left.key.clone(),
            length: left.length - offset,
            content,
            deleted: left.deleted,
            left: Some(idx),
            right: left.right,
        };
        left.length = offset;

        let next = right.right;
        let right_idx = self.push(right);
        if let Some(next) = next {
            self.items[next].left = Some(right_idx);
        }
        self.items[idx].right = Some(right_idx);
        right_idx
    }

    /// Flip the tombstone flag and record the span in the delete set.
    ///
    /// Returns `false` if the item was already deleted.
    pub fn tombstone(&mut self, idx: usize) -> bool {
        let item = &mut self.items[idx];
        if item.deleted {
            return false;
        }
        item.deleted = true;
        let range = IdRange::new(item.id.clone(), item.length);
        self.delete_set
            .entry(range.start.node_id().clone())
            .or_default()
            .push(range);
        true
    }

    /// Deleted spans recorded per node.
    #[must_use]
    pub fn delete_set(&self) -> &HashMap<NodeId, Vec<IdRange>> {
        &self.delete_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(physical: u64, logical: u32, node: &str) -> Id {
        Id::new(Hlc::new(physical, logical, NodeId::from(node)))
    }

    #[test]
    fn content_lengths() {
        assert_eq!(Content::Text("héllo".into()).len(), 5);
        assert_eq!(
            Content::Any(vec![serde_json::json!(1), serde_json::json!("x")]).len(),
            2
        );
        assert!(Content::Text(String::new()).is_empty());
    }

    #[test]
    fn find_resolves_units_inside_run() {
        let mut store = ItemStore::new();
        let idx = store.push(Item::new(
            id(10, 0, "a"),
            Content::Text("abc".into()),
            None,
            None,
            "t",
        ));

        assert_eq!(store.find(&id(10, 0, "a")), Some((idx, 0)));
        assert_eq!(store.find(&id(10, 2, "a")), Some((idx, 2)));
        assert_eq!(store.find(&id(10, 3, "a")), None);
        assert_eq!(store.find(&id(10, 1, "b")), None);
    }

    #[test]
    fn split_divides_content_and_ids() {
        let mut store = ItemStore::new();
        let idx = store.push(Item::new(
            id(10, 0, "a"),
            Content::Text("héllo".into()),
            None,
            Some(id(5, 0, "z")),
            "t",
        ));

        let right = store.split(idx, 2);

        assert_eq!(store.get(idx).content, Content::Text("hé".into()));
        assert_eq!(store.get(idx).length, 2);
        assert_eq!(store.get(right).content, Content::Text("llo".into()));
        assert_eq!(store.get(right).id, id(10, 2, "a"));
        assert_eq!(store.get(right).origin, Some(id(10, 1, "a")));
        assert_eq!(store.get(right).right_origin, Some(id(5, 0, "z")));
        assert_eq!(store.get(idx).right, Some(right));
        assert_eq!(store.get(right).left, Some(idx));

        // Both fragments stay resolvable
        assert_eq!(store.find(&id(10, 1, "a")), Some((idx, 1)));
        assert_eq!(store.find(&id(10, 4, "a")), Some((right, 2)));
    }

    #[test]
    fn tombstone_records_delete_set_once() {
        let mut store = ItemStore::new();
        let idx = store.push(Item::new(
            id(1, 0, "a"),
            Content::Any(vec![serde_json::json!(true)]),
            None,
            None,
            "arr",
        ));

        assert!(store.tombstone(idx));
        assert!(!store.tombstone(idx));
        assert!(store.get(idx).deleted);
        assert_eq!(store.delete_set()[&NodeId::from("a")].len(), 1);
    }
}

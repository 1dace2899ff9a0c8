//! YATA integration engine for ordered sequences.
//!
//! [`ItemChain`] keeps the items of one sequence type in a doubly linked
//! chain over an [`ItemStore`] arena. Integration places a new item between
//! its origins so that every replica integrating the same set of items, in
//! any order and with duplicates, ends up with the same chain.
//!
//! # Placement rule
//!
//! Scanning right from the left origin up to the right origin:
//!
//! | Scanned item | Action |
//! |--------------|--------|
//! | same origin, smaller id | new item goes after it |
//! | same origin, larger id, same right origin | stop, insert before it |
//! | same origin, larger id, other right origin | keep scanning |
//! | origin inside the scanned region | follows its origin's decision |
//! | origin outside the scanned region | stop, insert before it |

use crate::item::{Content, Id, IdRange, Item, ItemStore};
use crate::sync::HlcVector;
use std::collections::HashSet;

/// Result of an integration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integration {
    /// The item was spliced into the chain
    Integrated,
    /// An item with the same id is already present
    Duplicate,
    /// An origin is not (yet) known to this chain
    MissingOrigin(Id),
}

/// An ordered sequence of items.
#[derive(Debug, Clone, Default)]
pub struct ItemChain {
    store: ItemStore,
    start: Option<usize>,
    len: u32,
    pending_deletes: Vec<IdRange>,
}

impl ItemChain {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of visible units.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether no visible units remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The backing arena.
    #[must_use]
    pub fn store(&self) -> &ItemStore {
        &self.store
    }

    /// Deletes waiting for their target items to arrive.
    #[must_use]
    pub fn pending_deletes(&self) -> &[IdRange] {
        &self.pending_deletes
    }

    /// Iterate over every item in chain order, tombstones included.
    pub fn iter(&self) -> ChainIter<'_> {
        ChainIter {
            chain: self,
            next: self.start,
        }
    }

    /// Iterate over the content of visible items in chain order.
    pub fn visible(&self) -> impl Iterator<Item = &Content> {
        self.iter().filter(|item| !item.deleted).map(|item| &item.content)
    }

    /// Integrate an item at the position determined by its origins.
    pub fn integrate(&mut self, item: Item) -> Integration {
        if self.store.contains(&item.id) {
            return Integration::Duplicate;
        }
        for origin in [&item.origin, &item.right_origin].into_iter().flatten() {
            if !self.store.contains(origin) {
                return Integration::MissingOrigin(origin.clone());
            }
        }

        let left = item.origin.as_ref().and_then(|o| self.resolve_left(o));
        let right = item.right_origin.as_ref().and_then(|o| self.resolve_right(o));
        let left = self.place(&item, left, right);
        self.splice(item, left);
        Integration::Integrated
    }

    /// Integrate an item whose origins cannot be resolved, at a visible index.
    ///
    /// This is the degraded path: it keeps the replica running but gives no
    /// convergence guarantee for the placed item.
    pub fn integrate_at(&mut self, item: Item, index: u32) -> Integration {
        if self.store.contains(&item.id) {
            return Integration::Duplicate;
        }
        let (left, _) = self.neighbors_at(index.min(self.len));
        self.splice(item, left);
        Integration::Integrated
    }

    /// Find the `(left, right)` neighbor arena indices for an insert at
    /// visible `index`, splitting an item if the index falls inside it.
    ///
    /// `index` must not exceed [`len`](Self::len).
    pub fn neighbors_at(&mut self, index: u32) -> (Option<usize>, Option<usize>) {
        if index == 0 {
            return (None, self.start);
        }
        let mut remaining = index;
        let mut cursor = self.start;
        let mut last = None;
        while let Some(idx) = cursor {
            let item = self.store.get(idx);
            if !item.deleted {
                if remaining <= item.length {
                    if remaining < item.length {
                        self.store.split(idx, remaining);
                    }
                    return (Some(idx), self.store.get(idx).right);
                }
                remaining -= item.length;
            }
            last = Some(idx);
            cursor = item.right;
        }
        (last, None)
    }

    /// Origins `(left, right)` for an insert at visible `index`.
    pub fn origins_at(&mut self, index: u32) -> (Option<Id>, Option<Id>) {
        let (left, right) = self.neighbors_at(index);
        (
            left.map(|idx| self.store.get(idx).last_id()),
            right.map(|idx| self.store.get(idx).id.clone()),
        )
    }

    /// Tombstone `count` visible units starting at visible `index`.
    ///
    /// Returns the deleted id spans. The caller validates the bounds.
    pub fn delete_at(&mut self, index: u32, mut count: u32) -> Vec<IdRange> {
        let mut deleted = Vec::new();
        let mut skip = index;
        let mut cursor = self.start;

        while let Some(idx) = cursor {
            if count == 0 {
                break;
            }
            let item = self.store.get(idx);
            if item.deleted {
                cursor = item.right;
                continue;
            }
            if skip >= item.length {
                skip -= item.length;
                cursor = item.right;
                continue;
            }
            if skip > 0 {
                cursor = Some(self.store.split(idx, skip));
                skip = 0;
                continue;
            }
            if count < item.length {
                self.store.split(idx, count);
            }
            let item = self.store.get(idx);
            deleted.push(IdRange::new(item.id.clone(), item.length));
            count -= item.length;
            cursor = item.right;
            self.tombstone(idx);
        }
        deleted
    }

    /// Tombstone every unit in `range`, splitting items at the boundaries.
    ///
    /// Units that are not integrated yet are parked and deleted once their
    /// item arrives.
    pub fn delete_range(&mut self, range: &IdRange) {
        let mut next = range.start.clone();
        let mut remaining = range.len;

        while remaining > 0 {
            let Some((mut idx, offset)) = self.store.find(&next) else {
                self.pending_deletes.push(IdRange::new(next, remaining));
                return;
            };
            if offset > 0 {
                idx = self.store.split(idx, offset);
            }
            if remaining < self.store.get(idx).length {
                self.store.split(idx, remaining);
            }
            let covered = self.store.get(idx).length;
            self.tombstone(idx);
            next = next.offset(covered);
            remaining -= covered;
        }
    }

    /// Resolve the left origin to the arena index of the item ending at it.
    fn resolve_left(&mut self, origin: &Id) -> Option<usize> {
        let (idx, offset) = self.store.find(origin)?;
        if offset + 1 < self.store.get(idx).length {
            self.store.split(idx, offset + 1);
        }
        Some(idx)
    }

    /// Resolve the right origin to the arena index of the item starting at it.
    fn resolve_right(&mut self, origin: &Id) -> Option<usize> {
        let (idx, offset) = self.store.find(origin)?;
        if offset > 0 {
            Some(self.store.split(idx, offset))
        } else {
            Some(idx)
        }
    }

    /// Scan the region between the origins and return the item the new one
    /// is linked after.
    fn place(&self, item: &Item, mut left: Option<usize>, right: Option<usize>) -> Option<usize> {
        let mut cursor = match left {
            Some(idx) => self.store.get(idx).right,
            None => self.start,
        };
        let mut conflicting = HashSet::new();
        let mut before_origin = HashSet::new();

        while let Some(idx) = cursor {
            if Some(idx) == right {
                break;
            }
            before_origin.insert(idx);
            conflicting.insert(idx);

            let other = self.store.get(idx);
            if other.origin == item.origin {
                // Concurrent siblings anchored to the same left neighbor
                if other.id < item.id {
                    left = Some(idx);
                    conflicting.clear();
                } else if other.right_origin == item.right_origin {
                    break;
                }
            } else if let Some(origin_idx) = other
                .origin
                .as_ref()
                .and_then(|o| self.store.find(o))
                .map(|(i, _)| i)
                .filter(|i| before_origin.contains(i))
            {
                if !conflicting.contains(&origin_idx) {
                    left = Some(idx);
                    conflicting.clear();
                }
            } else {
                break;
            }
            cursor = other.right;
        }
        left
    }

    /// Link `item` directly after `left` (or at the head).
    fn splice(&mut self, mut item: Item, left: Option<usize>) {
        let right = match left {
            Some(idx) => self.store.get(idx).right,
            None => self.start,
        };
        item.left = left;
        item.right = right;
        let visible = item.visible_len();
        let idx = self.store.push(item);

        match left {
            Some(l) => self.store.get_mut(l).right = Some(idx),
            None => self.start = Some(idx),
        }
        if let Some(r) = right {
            self.store.get_mut(r).left = Some(idx);
        }
        self.len += visible;

        if !self.pending_deletes.is_empty() {
            self.retry_pending_deletes();
        }
    }

    fn tombstone(&mut self, idx: usize) {
        let length = self.store.get(idx).length;
        if self.store.tombstone(idx) {
            self.len -= length;
        }
    }

    fn retry_pending_deletes(&mut self) {
        let pending = std::mem::take(&mut self.pending_deletes);
        for range in &pending {
            self.delete_range(range);
        }
    }

    /// Drop parked deletes whose targets `covered` has already seen.
    ///
    /// After a full-state merge with vector `covered`, such targets can no
    /// longer arrive. Returns the number of ranges dropped.
    pub fn prune_pending_deletes(&mut self, covered: &HlcVector) -> usize {
        let before = self.pending_deletes.len();
        self.pending_deletes
            .retain(|range| !covered.has_seen(&range.last().0));
        before - self.pending_deletes.len()
    }
}

/// Iterator over a chain in document order.
pub struct ChainIter<'a> {
    chain: &'a ItemChain,
    next: Option<usize>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a Item;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.next?;
        let item = self.chain.store.get(idx);
        self.next = item.right;
        Some(item)
    }
}

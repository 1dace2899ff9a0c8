//! Full-state snapshots and their structural merge.
//!
//! A [`Snapshot`] carries every shared type with all of its items,
//! tombstones included. Merging one into a live document is a per-element
//! union, so it converges with whatever the document already holds.
//!
//! # Merge Rules
//!
//! | Shared type | Strategy |
//! |-------------|----------|
//! | Text / Array | Integrate unknown items in id order, then apply tombstones |
//! | Map | Integrate unknown items; the largest id per key stays live |
//! | GCounter | Per-node maximum |
//! | PnCounter | Per-node maximum of both halves |
//! | Registry | Most recent `share` wins on kind conflicts |

use crate::crdt::{GCounter, PnCounter};
use crate::document::{Document, DocumentOptions, SharedEntry, SharedType};
use crate::hlc::{Hlc, NodeId};
use crate::item::{Content, IdRange, ItemSnapshot, TypeKind};
use crate::sync::{HlcVector, UpdateError};
use crate::yata::{Integration, ItemChain};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Complete serializable state of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Node that produced the snapshot
    pub node_id: NodeId,
    /// Producer's clock at snapshot time
    pub hlc: Hlc,
    /// Producer's vector at snapshot time
    #[serde(default, rename = "hlc_vector")]
    pub hlc_vector: HlcVector,
    /// Registry key -> type state
    pub shared: BTreeMap<String, SharedSnapshot>,
}

/// One registered shared type in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedSnapshot {
    /// Declared kind
    #[serde(rename = "type")]
    pub kind: TypeKind,
    /// Stamp of the winning `share`, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_at: Option<Hlc>,
    /// Kind-specific state
    pub data: SharedData,
}

/// Kind-specific snapshot payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SharedData {
    /// Items of a map, array, or text
    Items(Vec<ItemSnapshot>),
    /// Grow-only counter state
    GCounter(GCounter),
    /// Increment/decrement counter state
    PnCounter(PnCounter),
}

impl Snapshot {
    /// Check that every payload matches its declared kind.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::MalformedUpdate`] on the first mismatch.
    pub fn validate(&self) -> Result<(), UpdateError> {
        for (key, shared) in &self.shared {
            let consistent = match (&shared.data, shared.kind) {
                (SharedData::Items(items), TypeKind::Map) => items
                    .iter()
                    .all(|item| item.key.is_some() && !item.content.is_empty()),
                (SharedData::Items(items), TypeKind::Text) => items
                    .iter()
                    .all(|item| matches!(&item.content, Content::Text(t) if !t.is_empty())),
                (SharedData::Items(items), TypeKind::Array) => items.iter().all(|item| {
                    !item.content.is_empty() && !matches!(item.content, Content::Text(_))
                }),
                (SharedData::GCounter(_), TypeKind::GCounter)
                | (SharedData::PnCounter(_), TypeKind::PnCounter) => true,
                _ => false,
            };
            if !consistent {
                return Err(UpdateError::MalformedUpdate(format!(
                    "snapshot entry '{key}' does not match kind {}",
                    shared.kind
                )));
            }
        }
        Ok(())
    }
}

impl Document {
    /// Capture the complete document state.
    #[must_use]
    pub fn to_snapshot(&self) -> Snapshot {
        let shared = self
            .shared
            .iter()
            .map(|(key, entry)| {
                let data = match &entry.value {
                    SharedType::Map(map) => SharedData::Items(map.to_snapshot()),
                    SharedType::Array(array) => SharedData::Items(array.to_snapshot()),
                    SharedType::Text(text) => SharedData::Items(text.to_snapshot()),
                    SharedType::GCounter(counter) => SharedData::GCounter(counter.clone()),
                    SharedType::PnCounter(counter) => SharedData::PnCounter(counter.clone()),
                };
                let snapshot = SharedSnapshot {
                    kind: entry.value.kind(),
                    shared_at: entry.shared_at.clone(),
                    data,
                };
                (key.clone(), snapshot)
            })
            .collect();

        Snapshot {
            node_id: self.node_id.clone(),
            hlc: self.clock.current().clone(),
            hlc_vector: self.hlc_vector.clone(),
            shared,
        }
    }

    /// Rebuild a document for `node_id` from a snapshot.
    ///
    /// The restored document has no history; its floor is the snapshot's
    /// vector, so peers behind it are served full state.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::MalformedUpdate`] if the snapshot is invalid.
    pub fn from_snapshot(
        node_id: impl Into<NodeId>,
        snapshot: &Snapshot,
    ) -> Result<Self, UpdateError> {
        Self::from_snapshot_with_options(node_id, snapshot, DocumentOptions::default())
    }

    /// Rebuild a document from a snapshot with explicit options.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::MalformedUpdate`] if the snapshot is invalid.
    pub fn from_snapshot_with_options(
        node_id: impl Into<NodeId>,
        snapshot: &Snapshot,
        options: DocumentOptions,
    ) -> Result<Self, UpdateError> {
        snapshot.validate()?;
        let mut doc = Document::with_options(node_id, options);
        doc.merge_snapshot(snapshot);
        doc.history.raise_floor(&snapshot.hlc_vector);
        for (_, hlc) in snapshot.hlc_vector.iter() {
            doc.clock.update(hlc);
        }
        doc.hlc_vector.merge(&snapshot.hlc_vector);
        doc.hlc_vector.observe(doc.clock.current().clone());
        Ok(doc)
    }

    /// Union a validated snapshot into this document.
    pub(crate) fn merge_snapshot(&mut self, snapshot: &Snapshot) {
        self.clock.update(&snapshot.hlc);

        for (key, shared) in &snapshot.shared {
            if !self.accept_share(key, shared) {
                continue;
            }
            self.register_nested_items(&shared.data);

            let Some(entry) = self.shared.get_mut(key) else {
                continue;
            };
            let covered = &snapshot.hlc_vector;
            let pruned = match (&mut entry.value, &shared.data) {
                (SharedType::Text(text), SharedData::Items(items)) => {
                    merge_chain(key, text.chain_mut(), items);
                    text.chain_mut().prune_pending_deletes(covered)
                }
                (SharedType::Array(array), SharedData::Items(items)) => {
                    merge_chain(key, array.chain_mut(), items);
                    array.chain_mut().prune_pending_deletes(covered)
                }
                (SharedType::Map(map), SharedData::Items(items)) => {
                    for item in items {
                        map.integrate(item.to_item(key));
                        if item.deleted {
                            map.delete_id(&item.id);
                        }
                    }
                    map.prune_pending_deletes(covered)
                }
                (SharedType::GCounter(counter), SharedData::GCounter(remote)) => {
                    let delta = remote.delta_since(counter);
                    let advanced = delta.iter().count();
                    if advanced > 0 {
                        counter.merge(&delta);
                        tracing::debug!(key, nodes = advanced, "Counter advanced by full state");
                    }
                    0
                }
                (SharedType::PnCounter(counter), SharedData::PnCounter(remote)) => {
                    counter.merge(remote);
                    0
                }
                (local, _) => {
                    tracing::warn!(key, local_kind = %local.kind(), "Snapshot data does not fit local type; skipped");
                    0
                }
            };
            if pruned > 0 {
                tracing::warn!(key, pruned, "Dropped deletes whose targets never arrived");
            }
        }
        self.hlc_vector.observe(self.clock.current().clone());
        tracing::debug!(
            node_id = %self.node_id,
            from = %snapshot.node_id,
            types = snapshot.shared.len(),
            "Merged full state"
        );
    }

    /// Decide whether a snapshot entry may merge into the local registry.
    fn accept_share(&mut self, key: &str, shared: &SharedSnapshot) -> bool {
        let Some(entry) = self.shared.get_mut(key) else {
            self.shared.insert(
                key.to_string(),
                SharedEntry::new(shared.kind, shared.shared_at.clone()),
            );
            return true;
        };

        let found = entry.value.kind();
        if found == shared.kind {
            if entry.shared_at < shared.shared_at {
                entry.shared_at.clone_from(&shared.shared_at);
            }
            return true;
        }

        if entry.shared_at < shared.shared_at {
            tracing::warn!(key, local_kind = %found, remote_kind = %shared.kind, "Type conflict: newer share replaces type");
            *entry = SharedEntry::new(shared.kind, shared.shared_at.clone());
            self.replay_history_for(key);
            true
        } else {
            tracing::warn!(key, local_kind = %found, remote_kind = %shared.kind, "Type conflict: older share ignored");
            false
        }
    }

    fn register_nested_items(&mut self, data: &SharedData) {
        let SharedData::Items(items) = data else {
            return;
        };
        for item in items {
            if let Content::Type(r) = &item.content {
                self.shared
                    .entry(r.key.clone())
                    .or_insert_with(|| SharedEntry::new(r.kind, Some(item.id.hlc().clone())));
            }
        }
    }
}

/// Integrate snapshot items into a chain, then apply its tombstones.
fn merge_chain(key: &str, chain: &mut ItemChain, items: &[ItemSnapshot]) {
    let mut pending: Vec<&ItemSnapshot> = items.iter().collect();
    pending.sort_by(|a, b| a.id.cmp(&b.id));

    loop {
        let before = pending.len();
        pending.retain(|snapshot| {
            matches!(
                chain.integrate(snapshot.to_item(key)),
                Integration::MissingOrigin(_)
            )
        });
        if pending.is_empty() || pending.len() == before {
            break;
        }
    }

    for snapshot in pending {
        tracing::warn!(key, id = %snapshot.id, "Unresolvable origin in snapshot: appending");
        chain.integrate_at(snapshot.to_item(key), chain.len());
    }

    for snapshot in items.iter().filter(|s| s.deleted) {
        chain.delete_range(&IdRange::new(snapshot.id.clone(), snapshot.content.len()));
    }
}

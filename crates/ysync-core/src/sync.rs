//! Delta synchronization protocol.
//!
//! A peer describes what it has seen with an [`HlcVector`]. The responder
//! answers with one of three [`Update`] kinds:
//!
//! - `delta_update`: the retained operations the peer has not seen
//! - `full_state`: a complete snapshot, when history no longer reaches back
//!   far enough to serve the peer
//! - `no_changes`: nothing new
//!
//! Applying any update is idempotent and commutative with respect to other
//! updates.

use crate::document::Document;
use crate::hlc::{Hlc, NodeId};
use crate::item::Content;
use crate::merge::Snapshot;
use crate::operation::{OpPayload, Operation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Latest known stamp per node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HlcVector(BTreeMap<NodeId, Hlc>);

impl HlcVector {
    /// Create an empty vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest stamp seen from a node.
    #[must_use]
    pub fn get(&self, node_id: &NodeId) -> Option<&Hlc> {
        self.0.get(node_id)
    }

    /// Raise the entry of `hlc.node_id` to at least `hlc`.
    pub fn observe(&mut self, hlc: Hlc) {
        match self.0.get_mut(&hlc.node_id) {
            Some(seen) if *seen >= hlc => {}
            Some(seen) => *seen = hlc,
            None => {
                self.0.insert(hlc.node_id.clone(), hlc);
            }
        }
    }

    /// Entry-wise maximum with another vector.
    pub fn merge(&mut self, other: &HlcVector) {
        for hlc in other.0.values() {
            self.observe(hlc.clone());
        }
    }

    /// Whether the stamp is covered by this vector.
    #[must_use]
    pub fn has_seen(&self, hlc: &Hlc) -> bool {
        self.get(&hlc.node_id).is_some_and(|seen| seen >= hlc)
    }

    /// Whether every entry of `other` is covered by this vector.
    #[must_use]
    pub fn covers(&self, other: &HlcVector) -> bool {
        other.0.values().all(|hlc| self.has_seen(hlc))
    }

    /// Iterate over entries in node order.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Hlc)> {
        self.0.iter()
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no node is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Hlc> for HlcVector {
    fn from_iter<I: IntoIterator<Item = Hlc>>(iter: I) -> Self {
        let mut vector = HlcVector::new();
        for hlc in iter {
            vector.observe(hlc);
        }
        vector
    }
}

/// A synchronization message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Update {
    /// Operations the requester has not seen
    DeltaUpdate {
        /// Responder node
        #[serde(rename = "nodeId")]
        node_id: NodeId,
        /// Operations in history order
        operations: Vec<Operation>,
        /// Responder's vector
        #[serde(rename = "hlc_vector")]
        hlc_vector: HlcVector,
    },
    /// Complete document state
    FullState {
        /// Responder's snapshot
        state: Snapshot,
        /// Responder's vector
        #[serde(rename = "hlc_vector")]
        hlc_vector: HlcVector,
    },
    /// Nothing new
    NoChanges {
        /// Responder's vector
        #[serde(rename = "hlc_vector")]
        hlc_vector: HlcVector,
    },
}

impl Update {
    /// Decode an update, distinguishing unknown kinds from malformed bodies.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::UnknownUpdateType`] if the `type` tag is not
    /// recognized, or [`UpdateError::MalformedUpdate`] otherwise.
    pub fn from_value(value: serde_json::Value) -> Result<Self, UpdateError> {
        match value.get("type").and_then(serde_json::Value::as_str) {
            Some("delta_update" | "full_state" | "no_changes") => serde_json::from_value(value)
                .map_err(|e| UpdateError::MalformedUpdate(e.to_string())),
            Some(other) => Err(UpdateError::UnknownUpdateType(other.to_string())),
            None => Err(UpdateError::MalformedUpdate(
                "missing update type".to_string(),
            )),
        }
    }

    /// Decode an update from JSON text.
    ///
    /// # Errors
    ///
    /// See [`Update::from_value`].
    pub fn from_json(json: &str) -> Result<Self, UpdateError> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| UpdateError::MalformedUpdate(e.to_string()))?;
        Self::from_value(value)
    }

    /// The sender's vector.
    #[must_use]
    pub fn hlc_vector(&self) -> &HlcVector {
        match self {
            Update::DeltaUpdate { hlc_vector, .. }
            | Update::FullState { hlc_vector, .. }
            | Update::NoChanges { hlc_vector } => hlc_vector,
        }
    }

    /// Wire name of the update kind.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Update::DeltaUpdate { .. } => "delta_update",
            Update::FullState { .. } => "full_state",
            Update::NoChanges { .. } => "no_changes",
        }
    }
}

impl Document {
    /// Compute what a peer with vector `remote` is missing.
    ///
    /// Falls back to full state when history no longer holds operations the
    /// peer needs.
    #[must_use]
    pub fn get_update_since(&self, remote: &HlcVector) -> Update {
        let hlc_vector = self.hlc_vector.clone();

        if !remote.covers(self.history.floor()) {
            tracing::warn!(
                node_id = %self.node_id,
                "Peer is behind retained history; sending full state"
            );
            return Update::FullState {
                state: self.to_snapshot(),
                hlc_vector,
            };
        }

        let operations: Vec<Operation> = self
            .history
            .iter()
            .filter(|op| !remote.has_seen(&op.hlc))
            .cloned()
            .collect();

        if operations.is_empty() {
            Update::NoChanges { hlc_vector }
        } else {
            tracing::debug!(
                node_id = %self.node_id,
                ops = operations.len(),
                "Sending delta update"
            );
            Update::DeltaUpdate {
                node_id: self.node_id.clone(),
                operations,
                hlc_vector,
            }
        }
    }

    /// Apply an update from a peer.
    ///
    /// The update is validated before anything changes, so a rejected update
    /// leaves the document untouched.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::MalformedUpdate`] if any part of the update is
    /// inconsistent.
    pub fn apply_update(&mut self, update: &Update) -> Result<(), UpdateError> {
        match update {
            Update::DeltaUpdate { operations, .. } => {
                for op in operations {
                    validate_operation(op)?;
                }
                self.apply_operations(operations);
            }
            Update::FullState { state, hlc_vector } => {
                state.validate()?;
                self.merge_snapshot(state);
                self.history.raise_floor(hlc_vector);
            }
            Update::NoChanges { .. } => {}
        }

        self.absorb_vector(update.hlc_vector());
        tracing::debug!(
            node_id = %self.node_id,
            kind = update.kind_name(),
            hlc = %self.clock.current(),
            "Applied update"
        );
        Ok(())
    }

    fn apply_operations(&mut self, operations: &[Operation]) {
        let fresh: Vec<Operation> = operations
            .iter()
            .filter(|op| !self.history.contains(&op.hlc))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return;
        }

        for op in &fresh {
            let last = op.last_hlc();
            self.clock.update(&last);
            self.hlc_vector.observe(last);
        }

        for op in self.replay_all(&fresh) {
            self.history.push(op);
        }
    }

    /// Merge a peer's vector and keep the own entry equal to the clock.
    fn absorb_vector(&mut self, incoming: &HlcVector) {
        for (_, hlc) in incoming.iter() {
            self.clock.update(hlc);
        }
        self.hlc_vector.merge(incoming);
        self.hlc_vector.observe(self.clock.current().clone());
    }
}

/// Reject operations whose content cannot be integrated.
fn validate_operation(op: &Operation) -> Result<(), UpdateError> {
    if op.node_id != op.hlc.node_id {
        return Err(UpdateError::MalformedUpdate(format!(
            "operation {} claims node {}",
            op.hlc, op.node_id
        )));
    }
    let malformed = |what: &str| -> Result<(), UpdateError> {
        Err(UpdateError::MalformedUpdate(format!(
            "{} {} has {what}",
            op.payload.kind_name(),
            op.hlc
        )))
    };
    match &op.payload {
        OpPayload::TextInsert { content, .. } if content.is_empty() => malformed("empty content"),
        OpPayload::ArrayInsert { content, .. } if content.is_empty() => malformed("empty content"),
        OpPayload::ArrayInsert {
            content: Content::Text(_),
            ..
        } => malformed("text content"),
        OpPayload::MapSet { value, .. } if value.is_empty() => malformed("empty value"),
        OpPayload::TextDelete { deleted, .. } | OpPayload::ArrayDelete { deleted, .. }
            if deleted.iter().any(|range| range.len == 0) =>
        {
            malformed("an empty delete range")
        }
        _ => Ok(()),
    }
}

/// Errors raised while decoding or applying updates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    /// The `type` tag names no known update kind
    #[error("unknown update type: {0}")]
    UnknownUpdateType(String),
    /// The update body is inconsistent or fails to decode
    #[error("malformed update: {0}")]
    MalformedUpdate(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentOptions, Replay};
    use crate::item::{Id, TypeKind};
    use serde_json::json;

    fn sync(from: &Document, to: &mut Document) {
        let update = from.get_update_since(to.hlc_vector());
        to.apply_update(&update).unwrap();
    }

    #[test]
    fn vector_observe_keeps_max() {
        let a = NodeId::from("a");
        let mut vector = HlcVector::new();
        vector.observe(Hlc::new(5, 0, a.clone()));
        vector.observe(Hlc::new(3, 9, a.clone()));
        assert_eq!(vector.get(&a), Some(&Hlc::new(5, 0, a.clone())));
        assert!(vector.has_seen(&Hlc::new(4, 0, a.clone())));
        assert!(!vector.has_seen(&Hlc::new(5, 1, a)));
    }

    #[test]
    fn delta_then_no_changes() {
        let mut a = Document::new("a");
        a.share("m", TypeKind::Map).unwrap();
        a.transact(|txn| txn.map_set("m", "x", json!(1))).unwrap();

        let mut b = Document::new("b");
        let update = a.get_update_since(b.hlc_vector());
        assert_eq!(update.kind_name(), "delta_update");
        b.apply_update(&update).unwrap();
        assert_eq!(b.get_map("m").unwrap().get("x"), Some(&json!(1)));

        let again = a.get_update_since(b.hlc_vector());
        assert!(matches!(again, Update::NoChanges { .. }));

        // Replaying the same delta changes nothing.
        b.apply_update(&update).unwrap();
        assert_eq!(b.to_json("m"), a.to_json("m"));
    }

    #[test]
    fn evicted_history_forces_full_state() {
        let options = DocumentOptions { history_limit: 3 };
        let mut a = Document::with_options("a", options);
        a.share("c", TypeKind::GCounter).unwrap();
        for _ in 0..5 {
            a.transact(|txn| txn.counter_increment("c", 1)).unwrap();
        }

        let mut b = Document::new("b");
        let update = a.get_update_since(b.hlc_vector());
        assert_eq!(update.kind_name(), "full_state");
        b.apply_update(&update).unwrap();
        assert_eq!(b.get_gcounter("c").unwrap().value(), 5);

        a.transact(|txn| txn.counter_increment("c", 2)).unwrap();
        let update = a.get_update_since(b.hlc_vector());
        assert_eq!(update.kind_name(), "delta_update");
        b.apply_update(&update).unwrap();
        assert_eq!(b.get_gcounter("c").unwrap().value(), 7);
    }

    #[test]
    fn own_vector_entry_tracks_clock() {
        let mut a = Document::new("a");
        let mut b = Document::new("b");
        a.share("t", TypeKind::Text).unwrap();
        a.transact(|txn| txn.text_insert("t", 0, "hi")).unwrap();
        sync(&a, &mut b);
        assert_eq!(b.hlc_vector().get(b.node_id()), Some(b.current_hlc()));
        assert!(b.current_hlc() > a.current_hlc());
    }

    #[test]
    fn concurrent_text_converges() {
        let mut a = Document::new("a");
        a.share("t", TypeKind::Text).unwrap();
        a.transact(|txn| txn.text_insert("t", 0, "ac")).unwrap();
        let mut b = Document::new("b");
        sync(&a, &mut b);

        a.transact(|txn| txn.text_insert("t", 1, "XX")).unwrap();
        b.transact(|txn| txn.text_insert("t", 1, "yy")).unwrap();
        b.transact(|txn| txn.text_delete("t", 0, 1)).unwrap();

        let from_a = a.get_update_since(b.hlc_vector());
        let from_b = b.get_update_since(a.hlc_vector());
        a.apply_update(&from_b).unwrap();
        b.apply_update(&from_a).unwrap();

        let text_a = a.get_text("t").unwrap().to_string();
        assert_eq!(text_a, b.get_text("t").unwrap().to_string());
        assert!(text_a == "XXyyc" || text_a == "yyXXc", "{text_a}");
    }

    #[test]
    fn unknown_update_type_is_distinguished() {
        let err = Update::from_value(json!({"type": "bogus", "hlc_vector": {}})).unwrap_err();
        assert_eq!(err, UpdateError::UnknownUpdateType("bogus".into()));

        let err = Update::from_value(json!({"type": "delta_update"})).unwrap_err();
        assert!(matches!(err, UpdateError::MalformedUpdate(_)));

        let ok = Update::from_value(json!({"type": "no_changes", "hlc_vector": {}})).unwrap();
        assert_eq!(ok, Update::NoChanges { hlc_vector: HlcVector::new() });
    }

    #[test]
    fn update_json_uses_hlc_vector_key() {
        let mut a = Document::new("a");
        a.share("t", TypeKind::Text).unwrap();

        let json = serde_json::to_value(a.get_update_since(a.hlc_vector())).unwrap();
        assert_eq!(json["type"], "no_changes");
        assert_eq!(json["hlc_vector"]["a"]["nodeId"], "a");

        let json = serde_json::to_value(a.get_update_since(&HlcVector::new())).unwrap();
        assert_eq!(json["type"], "delta_update");
        assert_eq!(json["nodeId"], "a");
        assert!(json.get("hlc_vector").is_some());
        assert!(json.get("hlcVector").is_none());

        let back = Update::from_value(json).unwrap();
        assert_eq!(back, a.get_update_since(&HlcVector::new()));
    }

    #[test]
    fn malformed_delta_leaves_document_untouched() {
        let mut a = Document::new("a");
        a.share("t", TypeKind::Text).unwrap();
        a.transact(|txn| txn.text_insert("t", 0, "ok")).unwrap();
        let Update::DeltaUpdate {
            node_id,
            mut operations,
            hlc_vector,
        } = a.get_update_since(&HlcVector::new())
        else {
            panic!("expected delta");
        };
        operations.push(Operation::new(
            Hlc::new(u64::MAX / 2, 0, NodeId::from("a")),
            OpPayload::TextInsert {
                target: "t".into(),
                index: 0,
                origin: None,
                right_origin: None,
                content: String::new(),
            },
        ));
        let bad = Update::DeltaUpdate {
            node_id,
            operations,
            hlc_vector,
        };

        let mut b = Document::new("b");
        let before = b.current_hlc().clone();
        assert!(matches!(
            b.apply_update(&bad),
            Err(UpdateError::MalformedUpdate(_))
        ));
        assert!(b.get_text("t").is_none());
        assert_eq!(b.current_hlc(), &before);
    }

    #[test]
    fn replay_covers_missing_origin_order() {
        let mut a = Document::new("a");
        a.share("t", TypeKind::Text).unwrap();
        a.transact(|txn| txn.text_insert("t", 0, "ab")).unwrap();
        a.transact(|txn| txn.text_insert("t", 2, "cd")).unwrap();

        let Update::DeltaUpdate {
            node_id,
            mut operations,
            hlc_vector,
        } = a.get_update_since(&HlcVector::new())
        else {
            panic!("expected delta");
        };
        operations.reverse();

        let mut b = Document::new("b");
        b.apply_update(&Update::DeltaUpdate {
            node_id,
            operations,
            hlc_vector,
        })
        .unwrap();
        assert_eq!(b.get_text("t").unwrap().to_string(), "abcd");
    }

    #[test]
    fn missing_origin_falls_back_to_recorded_index() {
        let mut a = Document::new("a");
        a.share("t", TypeKind::Text).unwrap();
        a.transact(|txn| txn.text_insert("t", 0, "xy")).unwrap();
        let mut b = Document::new("b");
        sync(&a, &mut b);

        // The origin belongs to an operation that never reaches b.
        let ghost = Id::new(Hlc::new(1, 0, NodeId::from("ghost")));
        let hlc = Hlc::new(a.current_hlc().physical_time + 1, 0, NodeId::from("z"));
        let op = Operation::new(
            hlc.clone(),
            OpPayload::TextInsert {
                target: "t".into(),
                index: 1,
                origin: Some(ghost),
                right_origin: None,
                content: "Q".into(),
            },
        );
        let update = Update::DeltaUpdate {
            node_id: NodeId::from("z"),
            operations: vec![op],
            hlc_vector: std::iter::once(hlc).collect(),
        };

        b.apply_update(&update).unwrap();
        assert_eq!(b.get_text("t").unwrap().to_string(), "xQy");

        b.apply_update(&update).unwrap();
        assert_eq!(b.get_text("t").unwrap().to_string(), "xQy");
        assert_eq!(b.history().len(), a.history().len() + 1);
    }

    #[test]
    fn replay_results_match_applied() {
        let mut doc = Document::new("a");
        let op = Operation::new(
            Hlc::new(1, 0, NodeId::from("z")),
            OpPayload::CounterIncrement {
                target: "c".into(),
                amount: 2,
                total: 2,
            },
        );
        assert_eq!(doc.apply_remote(&op), Replay::Applied);
        assert_eq!(doc.get_gcounter("c").unwrap().value(), 2);
    }
}

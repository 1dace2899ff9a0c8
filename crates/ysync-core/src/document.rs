//! Document model: clock, shared-type registry, and transactions.
//!
//! A [`Document`] is one replica. Local mutations go through a
//! [`Transaction`], which stamps each change with the document clock,
//! integrates it into the owning shared type, and appends an
//! [`Operation`] to the bounded history. Remote operations are replayed
//! through the same shared-type components (see [`crate::sync`]).

use crate::array::{Element, YArray};
use crate::crdt::{GCounter, PnCounter};
use crate::hlc::{Clock, Hlc, NodeId};
use crate::item::{Content, Id, Item, TypeKind, TypeRef};
use crate::map::YMap;
use crate::operation::{OpPayload, Operation, OperationLog, DEFAULT_HISTORY_LIMIT};
use crate::sync::HlcVector;
use crate::text::YText;
use crate::yata::Integration;
use std::collections::{BTreeMap, BTreeSet};

/// A shared type instance.
#[derive(Debug, Clone)]
pub enum SharedType {
    /// Last-writer-wins map
    Map(YMap),
    /// Ordered list
    Array(YArray),
    /// Collaborative text
    Text(YText),
    /// Grow-only counter
    GCounter(GCounter),
    /// Increment/decrement counter
    PnCounter(PnCounter),
}

impl SharedType {
    /// Create an empty instance of a kind.
    #[must_use]
    pub fn new(kind: TypeKind) -> Self {
        match kind {
            TypeKind::Map => SharedType::Map(YMap::new()),
            TypeKind::Array => SharedType::Array(YArray::new()),
            TypeKind::Text => SharedType::Text(YText::new()),
            TypeKind::GCounter => SharedType::GCounter(GCounter::new()),
            TypeKind::PnCounter => SharedType::PnCounter(PnCounter::new()),
        }
    }

    /// The kind of this instance.
    #[must_use]
    pub fn kind(&self) -> TypeKind {
        match self {
            SharedType::Map(_) => TypeKind::Map,
            SharedType::Array(_) => TypeKind::Array,
            SharedType::Text(_) => TypeKind::Text,
            SharedType::GCounter(_) => TypeKind::GCounter,
            SharedType::PnCounter(_) => TypeKind::PnCounter,
        }
    }
}

/// A registry entry: the type plus the stamp of the `share` that won.
#[derive(Debug, Clone)]
pub(crate) struct SharedEntry {
    pub(crate) value: SharedType,
    /// `None` when the type was created implicitly by a remote operation
    pub(crate) shared_at: Option<Hlc>,
}

impl SharedEntry {
    pub(crate) fn new(kind: TypeKind, shared_at: Option<Hlc>) -> Self {
        Self {
            value: SharedType::new(kind),
            shared_at,
        }
    }
}

/// Tunables for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentOptions {
    /// Maximum number of operations kept for delta reconciliation
    pub history_limit: usize,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// How a remote operation was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Replay {
    /// State changed (or the operation was absorbed idempotently)
    Applied,
    /// Already represented locally
    Duplicate,
    /// Needs an origin that has not arrived yet
    Deferred,
    /// Rejected by the type-conflict policy
    Dropped,
}

/// One replica of a replicated document.
#[derive(Debug, Clone)]
pub struct Document {
    pub(crate) node_id: NodeId,
    pub(crate) clock: Clock,
    pub(crate) hlc_vector: HlcVector,
    pub(crate) shared: BTreeMap<String, SharedEntry>,
    pub(crate) history: OperationLog,
}

impl Document {
    /// Create an empty document for a node.
    #[must_use]
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self::with_options(node_id, DocumentOptions::default())
    }

    /// Create an empty document with explicit options.
    #[must_use]
    pub fn with_options(node_id: impl Into<NodeId>, options: DocumentOptions) -> Self {
        let node_id = node_id.into();
        let clock = Clock::new(node_id.clone());
        let mut hlc_vector = HlcVector::new();
        hlc_vector.observe(clock.current().clone());
        Self {
            node_id,
            clock,
            hlc_vector,
            shared: BTreeMap::new(),
            history: OperationLog::new(options.history_limit),
        }
    }

    /// The node this replica runs as.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The latest local clock value.
    #[must_use]
    pub fn current_hlc(&self) -> &Hlc {
        self.clock.current()
    }

    /// Latest known clock per node.
    #[must_use]
    pub fn hlc_vector(&self) -> &HlcVector {
        &self.hlc_vector
    }

    /// Retained operation history.
    #[must_use]
    pub fn history(&self) -> &OperationLog {
        &self.history
    }

    /// Register a shared type and record a `share` operation.
    ///
    /// Sharing an existing key with the same kind is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::TypeConflict`] if the key already holds a
    /// different kind.
    pub fn share(&mut self, key: &str, kind: TypeKind) -> Result<(), DocumentError> {
        if let Some(entry) = self.shared.get(key) {
            let found = entry.value.kind();
            if found == kind {
                return Ok(());
            }
            return Err(DocumentError::TypeConflict {
                key: key.to_string(),
                expected: kind,
                found,
            });
        }

        let hlc = self.clock.tick();
        self.shared
            .insert(key.to_string(), SharedEntry::new(kind, Some(hlc.clone())));
        self.record(Operation::new(
            hlc,
            OpPayload::Share {
                target: key.to_string(),
                kind,
            },
        ));
        tracing::debug!(node_id = %self.node_id, key, %kind, "Shared type registered");
        Ok(())
    }

    /// Get a shared type by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&SharedType> {
        self.shared.get(key).map(|entry| &entry.value)
    }

    /// Get a map by key.
    #[must_use]
    pub fn get_map(&self, key: &str) -> Option<&YMap> {
        match self.get(key)? {
            SharedType::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Get an array by key.
    #[must_use]
    pub fn get_array(&self, key: &str) -> Option<&YArray> {
        match self.get(key)? {
            SharedType::Array(array) => Some(array),
            _ => None,
        }
    }

    /// Get a text by key.
    #[must_use]
    pub fn get_text(&self, key: &str) -> Option<&YText> {
        match self.get(key)? {
            SharedType::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Get a grow-only counter by key.
    #[must_use]
    pub fn get_gcounter(&self, key: &str) -> Option<&GCounter> {
        match self.get(key)? {
            SharedType::GCounter(counter) => Some(counter),
            _ => None,
        }
    }

    /// Get an increment/decrement counter by key.
    #[must_use]
    pub fn get_pncounter(&self, key: &str) -> Option<&PnCounter> {
        match self.get(key)? {
            SharedType::PnCounter(counter) => Some(counter),
            _ => None,
        }
    }

    /// Registered keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.shared.keys().map(String::as_str)
    }

    /// Open a transaction.
    pub fn transaction(&mut self) -> Transaction<'_> {
        Transaction {
            doc: self,
            ops: 0,
            touched: BTreeSet::new(),
        }
    }

    /// Run `f` inside a transaction.
    pub fn transact<R>(&mut self, f: impl FnOnce(&mut Transaction<'_>) -> R) -> R {
        let mut txn = self.transaction();
        f(&mut txn)
    }

    /// Render a shared type as JSON, resolving nested types.
    #[must_use]
    pub fn to_json(&self, key: &str) -> Option<serde_json::Value> {
        let value = match self.get(key)? {
            SharedType::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, content)| (k.to_string(), self.content_json(content)))
                    .collect(),
            ),
            SharedType::Array(array) => serde_json::Value::Array(
                array
                    .iter()
                    .map(|element| match element {
                        Element::Value(v) => v.clone(),
                        Element::Type(r) => self.to_json(&r.key).unwrap_or_default(),
                    })
                    .collect(),
            ),
            SharedType::Text(text) => serde_json::Value::String(text.to_string()),
            SharedType::GCounter(counter) => serde_json::Value::from(counter.value()),
            SharedType::PnCounter(counter) => serde_json::Value::from(counter.value()),
        };
        Some(value)
    }

    fn content_json(&self, content: &Content) -> serde_json::Value {
        match content {
            Content::Any(values) => values.first().cloned().unwrap_or_default(),
            Content::Text(text) => serde_json::Value::String(text.clone()),
            Content::Type(r) => self.to_json(&r.key).unwrap_or_default(),
        }
    }

    /// Append a local operation and keep the own vector entry current.
    fn record(&mut self, op: Operation) {
        self.history.push(op);
        self.hlc_vector.observe(self.clock.current().clone());
    }

    fn shared_mut(&mut self, key: &str) -> Result<&mut SharedType, DocumentError> {
        self.shared
            .get_mut(key)
            .map(|entry| &mut entry.value)
            .ok_or_else(|| DocumentError::UnknownType(key.to_string()))
    }

    fn map_mut(&mut self, key: &str) -> Result<&mut YMap, DocumentError> {
        match self.shared_mut(key)? {
            SharedType::Map(map) => Ok(map),
            other => Err(conflict(key, TypeKind::Map, other.kind())),
        }
    }

    fn text_mut(&mut self, key: &str) -> Result<&mut YText, DocumentError> {
        match self.shared_mut(key)? {
            SharedType::Text(text) => Ok(text),
            other => Err(conflict(key, TypeKind::Text, other.kind())),
        }
    }

    fn array_mut(&mut self, key: &str) -> Result<&mut YArray, DocumentError> {
        match self.shared_mut(key)? {
            SharedType::Array(array) => Ok(array),
            other => Err(conflict(key, TypeKind::Array, other.kind())),
        }
    }

    /// Register a nested type referenced by content, if not yet present.
    fn register_nested(&mut self, content: &Content, hlc: &Hlc) {
        if let Content::Type(r) = content {
            self.shared
                .entry(r.key.clone())
                .or_insert_with(|| SharedEntry::new(r.kind, Some(hlc.clone())));
        }
    }

    /// Look up (or implicitly create) the target of a remote operation.
    fn remote_target(&mut self, op: &Operation) -> Option<&mut SharedType> {
        let target = op.payload.target();
        let kind = match op.payload.required_kind() {
            Some(kind) => kind,
            None => match &op.payload {
                OpPayload::CounterDecrement { .. } => TypeKind::PnCounter,
                _ => TypeKind::GCounter,
            },
        };
        let entry = self
            .shared
            .entry(target.to_string())
            .or_insert_with(|| SharedEntry::new(kind, None));

        let found = entry.value.kind();
        let compatible = match op.payload.required_kind() {
            Some(required) => required == found,
            None => matches!(found, TypeKind::GCounter | TypeKind::PnCounter),
        };
        if compatible {
            Some(&mut entry.value)
        } else {
            tracing::warn!(
                target,
                op = op.payload.kind_name(),
                local_kind = %found,
                "Type conflict: dropping remote operation"
            );
            None
        }
    }

    /// Replay a remote operation through the owning shared type.
    ///
    /// Never fails: conflicts are resolved by policy and missing origins
    /// are reported as [`Replay::Deferred`].
    pub(crate) fn apply_remote(&mut self, op: &Operation) -> Replay {
        if let OpPayload::Share { target, kind } = &op.payload {
            return self.apply_share(target, *kind, &op.hlc);
        }
        let id = Id::new(op.hlc.clone());
        let node_id = op.node_id.clone();

        if let OpPayload::MapSet { value, .. } | OpPayload::ArrayInsert { content: value, .. } =
            &op.payload
        {
            self.register_nested(value, &op.hlc);
        }

        let Some(shared) = self.remote_target(op) else {
            return Replay::Dropped;
        };

        match (&op.payload, shared) {
            (
                OpPayload::MapSet {
                    target,
                    key,
                    origin,
                    value,
                },
                SharedType::Map(map),
            ) => {
                let item = Item::new(id, value.clone(), origin.clone(), None, target.as_str())
                    .with_key(key.as_str());
                if map.integrate(item) {
                    Replay::Applied
                } else {
                    Replay::Duplicate
                }
            }
            (OpPayload::MapDelete { deleted, .. }, SharedType::Map(map)) => {
                map.delete_id(deleted);
                Replay::Applied
            }
            (
                OpPayload::TextInsert {
                    target,
                    origin,
                    right_origin,
                    content,
                    ..
                },
                SharedType::Text(text),
            ) => {
                let item = Item::new(
                    id,
                    Content::Text(content.clone()),
                    origin.clone(),
                    right_origin.clone(),
                    target.as_str(),
                );
                replay_of(text.chain_mut().integrate(item))
            }
            (
                OpPayload::ArrayInsert {
                    target,
                    origin,
                    right_origin,
                    content,
                    ..
                },
                SharedType::Array(array),
            ) => {
                let item = Item::new(
                    id,
                    content.clone(),
                    origin.clone(),
                    right_origin.clone(),
                    target.as_str(),
                );
                replay_of(array.chain_mut().integrate(item))
            }
            (OpPayload::TextDelete { deleted, .. }, SharedType::Text(text)) => {
                for range in deleted {
                    text.chain_mut().delete_range(range);
                }
                Replay::Applied
            }
            (OpPayload::ArrayDelete { deleted, .. }, SharedType::Array(array)) => {
                for range in deleted {
                    array.chain_mut().delete_range(range);
                }
                Replay::Applied
            }
            (OpPayload::CounterIncrement { total, .. }, SharedType::GCounter(counter)) => {
                counter.observe(&node_id, *total);
                Replay::Applied
            }
            (OpPayload::CounterIncrement { total, .. }, SharedType::PnCounter(counter)) => {
                counter.observe(&node_id, *total, 0);
                Replay::Applied
            }
            (OpPayload::CounterDecrement { total, .. }, SharedType::PnCounter(counter)) => {
                counter.observe(&node_id, 0, *total);
                Replay::Applied
            }
            (payload, shared) => {
                tracing::warn!(
                    target = payload.target(),
                    op = payload.kind_name(),
                    local_kind = %shared.kind(),
                    "Unsupported operation for shared type; dropped"
                );
                Replay::Dropped
            }
        }
    }

    /// Integrate a deferred insert at its recorded index.
    ///
    /// Used when an origin never arrived; the result is a diagnostic signal
    /// of a gap in causal history.
    pub(crate) fn apply_fallback(&mut self, op: &Operation) -> Replay {
        let id = Id::new(op.hlc.clone());
        let Some(shared) = self.remote_target(op) else {
            return Replay::Dropped;
        };
        let (chain, item, index) = match (&op.payload, shared) {
            (
                OpPayload::TextInsert {
                    target,
                    index,
                    origin,
                    right_origin,
                    content,
                },
                SharedType::Text(text),
            ) => (
                text.chain_mut(),
                Item::new(
                    id,
                    Content::Text(content.clone()),
                    origin.clone(),
                    right_origin.clone(),
                    target.as_str(),
                ),
                *index,
            ),
            (
                OpPayload::ArrayInsert {
                    target,
                    index,
                    origin,
                    right_origin,
                    content,
                },
                SharedType::Array(array),
            ) => (
                array.chain_mut(),
                Item::new(
                    id,
                    content.clone(),
                    origin.clone(),
                    right_origin.clone(),
                    target.as_str(),
                ),
                *index,
            ),
            _ => return Replay::Dropped,
        };

        tracing::warn!(
            target = op.payload.target(),
            hlc = %op.hlc,
            index,
            "Unresolvable origin: falling back to position-based insertion"
        );
        replay_of(chain.integrate_at(item, index))
    }

    /// Resolve a remote `share`: the most recent share of a key wins.
    fn apply_share(&mut self, key: &str, kind: TypeKind, hlc: &Hlc) -> Replay {
        let Some(entry) = self.shared.get_mut(key) else {
            self.shared
                .insert(key.to_string(), SharedEntry::new(kind, Some(hlc.clone())));
            return Replay::Applied;
        };

        let found = entry.value.kind();
        if found == kind {
            if entry.shared_at.as_ref() < Some(hlc) {
                entry.shared_at = Some(hlc.clone());
            }
            return Replay::Applied;
        }

        let wins = entry.shared_at.as_ref().map_or(true, |at| hlc > at);
        if !wins {
            tracing::warn!(key, local_kind = %found, remote_kind = %kind, "Type conflict: older share ignored");
            return Replay::Applied;
        }

        tracing::warn!(key, local_kind = %found, remote_kind = %kind, "Type conflict: newer share replaces type");
        *entry = SharedEntry::new(kind, Some(hlc.clone()));
        self.replay_history_for(key);
        Replay::Applied
    }

    /// Re-apply retained operations for a key after its type was replaced.
    pub(crate) fn replay_history_for(&mut self, key: &str) {
        let ops: Vec<Operation> = self
            .history
            .iter()
            .filter(|op| {
                op.payload.target() == key && !matches!(op.payload, OpPayload::Share { .. })
            })
            .cloned()
            .collect();
        self.replay_all(&ops);
    }

    /// Apply operations, retrying deferred inserts until no progress is made
    /// and falling back to positions for the rest.
    pub(crate) fn replay_all(&mut self, ops: &[Operation]) -> Vec<Operation> {
        let mut applied = Vec::new();
        let mut deferred = Vec::new();
        for op in ops {
            match self.apply_remote(op) {
                Replay::Deferred => deferred.push(op.clone()),
                Replay::Applied | Replay::Duplicate | Replay::Dropped => applied.push(op.clone()),
            }
        }

        loop {
            let before = deferred.len();
            let mut still = Vec::new();
            for op in deferred {
                match self.apply_remote(&op) {
                    Replay::Deferred => still.push(op),
                    _ => applied.push(op),
                }
            }
            deferred = still;
            if deferred.is_empty() || deferred.len() == before {
                break;
            }
        }

        for op in deferred {
            self.apply_fallback(&op);
            applied.push(op);
        }
        applied
    }
}

/// A batching scope for local mutations.
///
/// Each mutation still advances the clock and appends one operation.
pub struct Transaction<'doc> {
    doc: &'doc mut Document,
    ops: usize,
    touched: BTreeSet<String>,
}

impl Transaction<'_> {
    /// The document being mutated.
    #[must_use]
    pub fn document(&self) -> &Document {
        self.doc
    }

    /// Register a shared type. See [`Document::share`].
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::TypeConflict`] if the key holds another kind.
    pub fn share(&mut self, key: &str, kind: TypeKind) -> Result<(), DocumentError> {
        self.doc.share(key, kind)
    }

    /// Set a map entry to a plain value.
    ///
    /// # Errors
    ///
    /// Fails if `target` is not a registered map.
    pub fn map_set(
        &mut self,
        target: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), DocumentError> {
        self.map_set_content(target, key, Content::Any(vec![value]), None)
    }

    /// Set a map entry to a new nested shared type. Returns its key.
    ///
    /// # Errors
    ///
    /// Fails if `target` is not a registered map.
    pub fn map_set_type(
        &mut self,
        target: &str,
        key: &str,
        kind: TypeKind,
    ) -> Result<String, DocumentError> {
        self.doc.map_mut(target)?;
        let hlc = self.doc.clock.tick();
        let child = nested_key(target, &hlc);
        let content = Content::Type(TypeRef {
            key: child.clone(),
            kind,
        });
        self.map_set_content(target, key, content, Some(hlc))?;
        Ok(child)
    }

    fn map_set_content(
        &mut self,
        target: &str,
        key: &str,
        value: Content,
        hlc: Option<Hlc>,
    ) -> Result<(), DocumentError> {
        let origin = self.doc.map_mut(target)?.live_id(key).cloned();
        let hlc = match hlc {
            Some(hlc) => hlc,
            None => self.doc.clock.tick(),
        };
        self.doc.register_nested(&value, &hlc);

        let item = Item::new(
            Id::new(hlc.clone()),
            value.clone(),
            origin.clone(),
            None,
            target,
        )
        .with_key(key);
        self.doc.map_mut(target)?.integrate(item);

        self.commit(Operation::new(
            hlc,
            OpPayload::MapSet {
                target: target.to_string(),
                key: key.to_string(),
                origin,
                value,
            },
        ));
        Ok(())
    }

    /// Delete a map entry. Returns `false` if the key had no live value.
    ///
    /// # Errors
    ///
    /// Fails if `target` is not a registered map.
    pub fn map_delete(&mut self, target: &str, key: &str) -> Result<bool, DocumentError> {
        let Some(deleted) = self.doc.map_mut(target)?.delete(key) else {
            return Ok(false);
        };
        let hlc = self.doc.clock.tick();
        self.commit(Operation::new(
            hlc,
            OpPayload::MapDelete {
                target: target.to_string(),
                key: key.to_string(),
                deleted,
            },
        ));
        Ok(true)
    }

    /// Insert characters at a visible index.
    ///
    /// # Errors
    ///
    /// Fails if `target` is not a registered text or `index > len`.
    pub fn text_insert(&mut self, target: &str, index: u32, text: &str) -> Result<(), DocumentError> {
        let len = self.doc.text_mut(target)?.len();
        check_index(index, 0, len)?;
        let content = Content::Text(text.to_string());
        if content.is_empty() {
            return Ok(());
        }

        let hlc = self.doc.clock.tick_span(content.len());
        let chain = self.doc.text_mut(target)?.chain_mut();
        let (origin, right_origin) = chain.origins_at(index);
        chain.integrate(Item::new(
            Id::new(hlc.clone()),
            content,
            origin.clone(),
            right_origin.clone(),
            target,
        ));

        self.commit(Operation::new(
            hlc,
            OpPayload::TextInsert {
                target: target.to_string(),
                index,
                origin,
                right_origin,
                content: text.to_string(),
            },
        ));
        Ok(())
    }

    /// Delete `count` characters starting at a visible index.
    ///
    /// # Errors
    ///
    /// Fails if `target` is not a registered text or the range exceeds `len`.
    pub fn text_delete(&mut self, target: &str, index: u32, count: u32) -> Result<(), DocumentError> {
        let len = self.doc.text_mut(target)?.len();
        check_index(index, count, len)?;
        if count == 0 {
            return Ok(());
        }

        let hlc = self.doc.clock.tick();
        let deleted = self.doc.text_mut(target)?.chain_mut().delete_at(index, count);
        self.commit(Operation::new(
            hlc,
            OpPayload::TextDelete {
                target: target.to_string(),
                index,
                count,
                deleted,
            },
        ));
        Ok(())
    }

    /// Insert one value at a visible index.
    ///
    /// # Errors
    ///
    /// Fails if `target` is not a registered array or `index > len`.
    pub fn array_insert(
        &mut self,
        target: &str,
        index: u32,
        value: serde_json::Value,
    ) -> Result<(), DocumentError> {
        self.array_insert_many(target, index, vec![value])
    }

    /// Insert several values at a visible index as one run.
    ///
    /// # Errors
    ///
    /// Fails if `target` is not a registered array or `index > len`.
    pub fn array_insert_many(
        &mut self,
        target: &str,
        index: u32,
        values: Vec<serde_json::Value>,
    ) -> Result<(), DocumentError> {
        let len = self.doc.array_mut(target)?.len();
        check_index(index, 0, len)?;
        let content = Content::Any(values);
        if content.is_empty() {
            return Ok(());
        }
        let hlc = self.doc.clock.tick_span(content.len());
        self.array_insert_content(target, index, content, hlc)
    }

    /// Append one value.
    ///
    /// # Errors
    ///
    /// Fails if `target` is not a registered array.
    pub fn array_push(&mut self, target: &str, value: serde_json::Value) -> Result<(), DocumentError> {
        let len = self.doc.array_mut(target)?.len();
        self.array_insert(target, len, value)
    }

    /// Insert a new nested shared type at a visible index. Returns its key.
    ///
    /// # Errors
    ///
    /// Fails if `target` is not a registered array or `index > len`.
    pub fn array_insert_type(
        &mut self,
        target: &str,
        index: u32,
        kind: TypeKind,
    ) -> Result<String, DocumentError> {
        let len = self.doc.array_mut(target)?.len();
        check_index(index, 0, len)?;
        let hlc = self.doc.clock.tick();
        let child = nested_key(target, &hlc);
        let content = Content::Type(TypeRef {
            key: child.clone(),
            kind,
        });
        self.array_insert_content(target, index, content, hlc)?;
        Ok(child)
    }

    fn array_insert_content(
        &mut self,
        target: &str,
        index: u32,
        content: Content,
        hlc: Hlc,
    ) -> Result<(), DocumentError> {
        self.doc.register_nested(&content, &hlc);

        let chain = self.doc.array_mut(target)?.chain_mut();
        let (origin, right_origin) = chain.origins_at(index);
        chain.integrate(Item::new(
            Id::new(hlc.clone()),
            content.clone(),
            origin.clone(),
            right_origin.clone(),
            target,
        ));

        self.commit(Operation::new(
            hlc,
            OpPayload::ArrayInsert {
                target: target.to_string(),
                index,
                origin,
                right_origin,
                content,
            },
        ));
        Ok(())
    }

    /// Delete `count` elements starting at a visible index.
    ///
    /// # Errors
    ///
    /// Fails if `target` is not a registered array or the range exceeds `len`.
    pub fn array_delete(&mut self, target: &str, index: u32, count: u32) -> Result<(), DocumentError> {
        let len = self.doc.array_mut(target)?.len();
        check_index(index, count, len)?;
        if count == 0 {
            return Ok(());
        }

        let hlc = self.doc.clock.tick();
        let deleted = self.doc.array_mut(target)?.chain_mut().delete_at(index, count);
        self.commit(Operation::new(
            hlc,
            OpPayload::ArrayDelete {
                target: target.to_string(),
                index,
                count,
                deleted,
            },
        ));
        Ok(())
    }

    /// Increment a counter by this node.
    ///
    /// # Errors
    ///
    /// Fails if `target` is not a registered counter.
    pub fn counter_increment(&mut self, target: &str, amount: u64) -> Result<(), DocumentError> {
        let node_id = self.doc.node_id.clone();
        let total = match self.doc.shared_mut(target)? {
            SharedType::GCounter(counter) => counter.increment(&node_id, amount),
            SharedType::PnCounter(counter) => counter.increment(&node_id, amount),
            other => return Err(conflict(target, TypeKind::GCounter, other.kind())),
        };
        let hlc = self.doc.clock.tick();
        self.commit(Operation::new(
            hlc,
            OpPayload::CounterIncrement {
                target: target.to_string(),
                amount,
                total,
            },
        ));
        Ok(())
    }

    /// Decrement a PN-counter by this node.
    ///
    /// # Errors
    ///
    /// Fails if `target` is not a PN-counter; grow-only counters report
    /// [`DocumentError::UnsupportedOperation`].
    pub fn counter_decrement(&mut self, target: &str, amount: u64) -> Result<(), DocumentError> {
        let node_id = self.doc.node_id.clone();
        let total = match self.doc.shared_mut(target)? {
            SharedType::PnCounter(counter) => counter.decrement(&node_id, amount),
            SharedType::GCounter(_) => {
                return Err(DocumentError::UnsupportedOperation {
                    operation: "counter_decrement",
                    kind: TypeKind::GCounter,
                })
            }
            other => return Err(conflict(target, TypeKind::PnCounter, other.kind())),
        };
        let hlc = self.doc.clock.tick();
        self.commit(Operation::new(
            hlc,
            OpPayload::CounterDecrement {
                target: target.to_string(),
                amount,
                total,
            },
        ));
        Ok(())
    }

    /// Add a signed amount to a counter.
    ///
    /// # Errors
    ///
    /// See [`counter_increment`](Self::counter_increment) and
    /// [`counter_decrement`](Self::counter_decrement).
    pub fn counter_add(&mut self, target: &str, amount: i64) -> Result<(), DocumentError> {
        if amount >= 0 {
            self.counter_increment(target, amount.unsigned_abs())
        } else {
            self.counter_decrement(target, amount.unsigned_abs())
        }
    }

    fn commit(&mut self, op: Operation) {
        tracing::debug!(
            node_id = %self.doc.node_id,
            op = op.payload.kind_name(),
            target = op.payload.target(),
            hlc = %op.hlc,
            "Applied local operation"
        );
        self.touched.insert(op.payload.target().to_string());
        self.ops += 1;
        self.doc.record(op);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.ops > 0 {
            tracing::debug!(
                node_id = %self.doc.node_id,
                ops = self.ops,
                touched = ?self.touched,
                "Transaction closed"
            );
        }
    }
}

fn nested_key(parent: &str, hlc: &Hlc) -> String {
    format!("{parent}/{hlc}")
}

fn check_index(index: u32, count: u32, len: u32) -> Result<(), DocumentError> {
    match index.checked_add(count) {
        Some(end) if end <= len => Ok(()),
        _ => Err(DocumentError::InvalidIndex { index, count, len }),
    }
}

fn conflict(key: &str, expected: TypeKind, found: TypeKind) -> DocumentError {
    DocumentError::TypeConflict {
        key: key.to_string(),
        expected,
        found,
    }
}

fn replay_of(integration: Integration) -> Replay {
    match integration {
        Integration::Integrated => Replay::Applied,
        Integration::Duplicate => Replay::Duplicate,
        Integration::MissingOrigin(_) => Replay::Deferred,
    }
}

/// Errors from local document operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    /// Index (plus count) outside `[0, len]`
    #[error("index {index} (+{count}) out of bounds for length {len}")]
    InvalidIndex {
        /// Requested index
        index: u32,
        /// Requested count (0 for inserts)
        count: u32,
        /// Visible length
        len: u32,
    },
    /// The key holds a different kind of shared type
    #[error("shared type '{key}' is a {found}, not a {expected}")]
    TypeConflict {
        /// Registry key
        key: String,
        /// Kind the caller asked for
        expected: TypeKind,
        /// Kind registered locally
        found: TypeKind,
    },
    /// Nothing is registered under the key
    #[error("no shared type registered under '{0}'")]
    UnknownType(String),
    /// The shared type cannot perform the operation
    #[error("{operation} is not supported by a {kind}")]
    UnsupportedOperation {
        /// Operation name
        operation: &'static str,
        /// Kind of the target
        kind: TypeKind,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_scenario() {
        let mut doc = Document::new("a");
        doc.share("text", TypeKind::Text).unwrap();

        doc.transact(|txn| txn.text_insert("text", 0, "Hello")).unwrap();
        doc.transact(|txn| txn.text_insert("text", 5, " World")).unwrap();
        assert_eq!(doc.get_text("text").unwrap().to_string(), "Hello World");

        doc.transact(|txn| txn.text_insert("text", 11, "!")).unwrap();
        assert_eq!(doc.get_text("text").unwrap().to_string(), "Hello World!");

        doc.transact(|txn| txn.text_delete("text", 5, 6)).unwrap();
        assert_eq!(doc.get_text("text").unwrap().to_string(), "Hello!");
    }

    #[test]
    fn invalid_index_fails_without_side_effects() {
        let mut doc = Document::new("a");
        doc.share("text", TypeKind::Text).unwrap();
        let before = doc.current_hlc().clone();
        let history = doc.history().len();

        let err = doc.transact(|txn| txn.text_insert("text", 1, "x")).unwrap_err();
        assert_eq!(
            err,
            DocumentError::InvalidIndex {
                index: 1,
                count: 0,
                len: 0
            }
        );
        assert_eq!(doc.current_hlc(), &before);
        assert_eq!(doc.history().len(), history);

        doc.share("list", TypeKind::Array).unwrap();
        doc.transact(|txn| txn.array_push("list", json!(1))).unwrap();
        assert!(matches!(
            doc.transact(|txn| txn.array_delete("list", 0, 2)),
            Err(DocumentError::InvalidIndex { .. })
        ));
    }

    #[test]
    fn share_conflict_is_rejected_locally() {
        let mut doc = Document::new("a");
        doc.share("x", TypeKind::Map).unwrap();
        doc.share("x", TypeKind::Map).unwrap();
        assert!(matches!(
            doc.share("x", TypeKind::Text),
            Err(DocumentError::TypeConflict { .. })
        ));
        assert!(matches!(
            doc.transact(|txn| txn.text_insert("x", 0, "a")),
            Err(DocumentError::TypeConflict { .. })
        ));
        assert!(matches!(
            doc.transact(|txn| txn.text_insert("missing", 0, "a")),
            Err(DocumentError::UnknownType(_))
        ));
    }

    #[test]
    fn every_mutation_appends_one_operation() {
        let mut doc = Document::new("a");
        doc.share("m", TypeKind::Map).unwrap();
        doc.share("c", TypeKind::PnCounter).unwrap();

        doc.transact(|txn| {
            txn.map_set("m", "k", json!(1))?;
            txn.map_set("m", "k", json!(2))?;
            txn.map_delete("m", "k")?;
            txn.counter_add("c", -3)?;
            txn.counter_add("c", 5)
        })
        .unwrap();

        let kinds: Vec<&str> = doc.history().iter().map(|op| op.payload.kind_name()).collect();
        assert_eq!(
            kinds,
            [
                "share",
                "share",
                "map_set",
                "map_set",
                "map_delete",
                "counter_decrement",
                "counter_increment"
            ]
        );
        assert_eq!(doc.get_pncounter("c").unwrap().value(), 2);
        assert_eq!(doc.get_map("m").unwrap().get("k"), None);
        assert_eq!(doc.hlc_vector().get(doc.node_id()), Some(doc.current_hlc()));
    }

    #[test]
    fn gcounter_rejects_decrement() {
        let mut doc = Document::new("a");
        doc.share("g", TypeKind::GCounter).unwrap();
        doc.transact(|txn| txn.counter_increment("g", 4)).unwrap();
        assert!(matches!(
            doc.transact(|txn| txn.counter_decrement("g", 1)),
            Err(DocumentError::UnsupportedOperation { .. })
        ));
        assert_eq!(doc.get_gcounter("g").unwrap().value(), 4);
    }

    #[test]
    fn nested_types_render_as_json() {
        let mut doc = Document::new("a");
        doc.share("root", TypeKind::Map).unwrap();

        let list = doc
            .transact(|txn| txn.map_set_type("root", "items", TypeKind::Array))
            .unwrap();
        doc.transact(|txn| {
            txn.array_push(&list, json!("first"))?;
            let title = txn.array_insert_type(&list, 1, TypeKind::Text)?;
            txn.text_insert(&title, 0, "hi")?;
            txn.map_set("root", "count", json!(2))
        })
        .unwrap();

        assert_eq!(
            doc.to_json("root").unwrap(),
            json!({"count": 2, "items": ["first", "hi"]})
        );
    }
}

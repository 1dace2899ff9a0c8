//! Operation log used for delta reconciliation.
//!
//! Every local mutation appends one [`Operation`]; remote operations are
//! appended as they are applied. The log is bounded: once it exceeds its
//! limit the oldest entries are evicted and remembered only through the
//! per-node *floor* (the newest evicted stamp), which tells the sync layer
//! when a peer can no longer be served from history.

use crate::hlc::{Hlc, NodeId};
use crate::item::{Content, Id, IdRange, TypeKind};
use crate::sync::HlcVector;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// Default number of operations retained in history.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// An immutable record of one mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Node that performed the mutation
    #[serde(rename = "nodeId")]
    pub node_id: NodeId,
    /// Stamp of the mutation; for inserts also the id of the first unit
    pub hlc: Hlc,
    /// What changed
    #[serde(flatten)]
    pub payload: OpPayload,
}

/// Mutation-specific data, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpPayload {
    /// A shared type was registered
    Share {
        /// Registry key
        target: String,
        /// Declared kind
        kind: TypeKind,
    },
    /// A map key was set
    MapSet {
        /// Map registry key
        target: String,
        /// Entry key
        key: String,
        /// Id of the superseded live item, if any
        origin: Option<Id>,
        /// New content
        value: Content,
    },
    /// A map key was deleted
    MapDelete {
        /// Map registry key
        target: String,
        /// Entry key
        key: String,
        /// Id of the tombstoned item
        deleted: Id,
    },
    /// Characters were inserted into a text
    TextInsert {
        /// Text registry key
        target: String,
        /// Visible index at creation time, used only as a fallback
        index: u32,
        /// Left origin
        origin: Option<Id>,
        /// Right origin
        right_origin: Option<Id>,
        /// Inserted characters
        content: String,
    },
    /// Characters were deleted from a text
    TextDelete {
        /// Text registry key
        target: String,
        /// Visible index at creation time
        index: u32,
        /// Number of characters
        count: u32,
        /// Tombstoned id spans
        deleted: Vec<IdRange>,
    },
    /// Elements were inserted into an array
    ArrayInsert {
        /// Array registry key
        target: String,
        /// Visible index at creation time, used only as a fallback
        index: u32,
        /// Left origin
        origin: Option<Id>,
        /// Right origin
        right_origin: Option<Id>,
        /// Inserted values or nested type
        content: Content,
    },
    /// Elements were deleted from an array
    ArrayDelete {
        /// Array registry key
        target: String,
        /// Visible index at creation time
        index: u32,
        /// Number of elements
        count: u32,
        /// Tombstoned id spans
        deleted: Vec<IdRange>,
    },
    /// A counter was incremented
    CounterIncrement {
        /// Counter registry key
        target: String,
        /// Amount added
        amount: u64,
        /// The node's positive total afterwards
        total: u64,
    },
    /// A counter was decremented
    CounterDecrement {
        /// Counter registry key
        target: String,
        /// Amount subtracted
        amount: u64,
        /// The node's negative total afterwards
        total: u64,
    },
}

impl OpPayload {
    /// The registry key this payload targets.
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            OpPayload::Share { target, .. }
            | OpPayload::MapSet { target, .. }
            | OpPayload::MapDelete { target, .. }
            | OpPayload::TextInsert { target, .. }
            | OpPayload::TextDelete { target, .. }
            | OpPayload::ArrayInsert { target, .. }
            | OpPayload::ArrayDelete { target, .. }
            | OpPayload::CounterIncrement { target, .. }
            | OpPayload::CounterDecrement { target, .. } => target,
        }
    }

    /// The shared-type kind this payload requires, if it is kind-specific.
    ///
    /// Counter operations apply to both counter kinds and return `None`.
    #[must_use]
    pub fn required_kind(&self) -> Option<TypeKind> {
        match self {
            OpPayload::Share { kind, .. } => Some(*kind),
            OpPayload::MapSet { .. } | OpPayload::MapDelete { .. } => Some(TypeKind::Map),
            OpPayload::TextInsert { .. } | OpPayload::TextDelete { .. } => Some(TypeKind::Text),
            OpPayload::ArrayInsert { .. } | OpPayload::ArrayDelete { .. } => {
                Some(TypeKind::Array)
            }
            OpPayload::CounterIncrement { .. } | OpPayload::CounterDecrement { .. } => None,
        }
    }

    /// Short name of the payload kind, for logging.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            OpPayload::Share { .. } => "share",
            OpPayload::MapSet { .. } => "map_set",
            OpPayload::MapDelete { .. } => "map_delete",
            OpPayload::TextInsert { .. } => "text_insert",
            OpPayload::TextDelete { .. } => "text_delete",
            OpPayload::ArrayInsert { .. } => "array_insert",
            OpPayload::ArrayDelete { .. } => "array_delete",
            OpPayload::CounterIncrement { .. } => "counter_increment",
            OpPayload::CounterDecrement { .. } => "counter_decrement",
        }
    }
}

impl Operation {
    /// Create a new operation.
    #[must_use]
    pub fn new(hlc: Hlc, payload: OpPayload) -> Self {
        Self {
            node_id: hlc.node_id.clone(),
            hlc,
            payload,
        }
    }

    /// Number of ids this operation consumed from its node's clock.
    #[must_use]
    pub fn span(&self) -> u32 {
        let span = match &self.payload {
            OpPayload::TextInsert { content, .. } => {
                u32::try_from(content.chars().count()).unwrap_or(u32::MAX)
            }
            OpPayload::ArrayInsert { content, .. } | OpPayload::MapSet { value: content, .. } => {
                content.len()
            }
            _ => 1,
        };
        span.max(1)
    }

    /// The last stamp consumed by this operation.
    #[must_use]
    pub fn last_hlc(&self) -> Hlc {
        self.hlc.offset(self.span() - 1)
    }
}

/// Bounded, deduplicated history of operations.
#[derive(Debug, Clone)]
pub struct OperationLog {
    ops: VecDeque<Operation>,
    seen: HashSet<Hlc>,
    limit: usize,
    floor: HlcVector,
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl OperationLog {
    /// Create an empty log retaining at most `limit` operations.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            ops: VecDeque::new(),
            seen: HashSet::new(),
            limit: limit.max(1),
            floor: HlcVector::new(),
        }
    }

    /// Append an operation. Returns `false` if it is already retained.
    pub fn push(&mut self, op: Operation) -> bool {
        if !self.seen.insert(op.hlc.clone()) {
            return false;
        }
        self.ops.push_back(op);

        while self.ops.len() > self.limit {
            if let Some(evicted) = self.ops.pop_front() {
                self.seen.remove(&evicted.hlc);
                self.floor.observe(evicted.last_hlc());
                tracing::debug!(
                    node_id = %evicted.node_id,
                    hlc = %evicted.hlc,
                    "Evicted operation from history"
                );
            }
        }
        true
    }

    /// Whether an operation with this stamp is retained.
    #[must_use]
    pub fn contains(&self, hlc: &Hlc) -> bool {
        self.seen.contains(hlc)
    }

    /// Mark everything up to `vector` as unavailable from history.
    pub fn raise_floor(&mut self, vector: &HlcVector) {
        self.floor.merge(vector);
    }

    /// Newest stamp per node that history can no longer serve.
    #[must_use]
    pub fn floor(&self) -> &HlcVector {
        &self.floor
    }

    /// Iterate over retained operations, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.iter()
    }

    /// Number of retained operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether no operations are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Maximum number of retained operations.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(physical: u64, node: &str, n: u32) -> Operation {
        Operation::new(
            Hlc::new(physical, 0, NodeId::from(node)),
            OpPayload::CounterIncrement {
                target: "c".into(),
                amount: 1,
                total: u64::from(n),
            },
        )
    }

    #[test]
    fn push_deduplicates() {
        let mut log = OperationLog::new(10);
        assert!(log.push(op(1, "a", 1)));
        assert!(!log.push(op(1, "a", 1)));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn eviction_raises_floor() {
        let mut log = OperationLog::new(2);
        log.push(op(1, "a", 1));
        log.push(op(2, "b", 1));
        log.push(op(3, "a", 2));

        assert_eq!(log.len(), 2);
        assert!(!log.contains(&Hlc::new(1, 0, NodeId::from("a"))));
        assert_eq!(
            log.floor().get(&NodeId::from("a")),
            Some(&Hlc::new(1, 0, NodeId::from("a")))
        );
        assert_eq!(log.floor().get(&NodeId::from("b")), None);
    }

    #[test]
    fn insert_span_covers_run() {
        let insert = Operation::new(
            Hlc::new(7, 2, NodeId::from("a")),
            OpPayload::TextInsert {
                target: "t".into(),
                index: 0,
                origin: None,
                right_origin: None,
                content: "abc".into(),
            },
        );
        assert_eq!(insert.span(), 3);
        assert_eq!(insert.last_hlc(), Hlc::new(7, 4, NodeId::from("a")));
    }

    #[test]
    fn json_shape_is_tagged() {
        let json = serde_json::to_value(op(1, "a", 3)).unwrap();
        assert_eq!(json["type"], "counter_increment");
        assert_eq!(json["target"], "c");
        assert_eq!(json["nodeId"], "a");
        assert_eq!(json["hlc"]["physicalTime"], 1);

        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op(1, "a", 3));
    }
}

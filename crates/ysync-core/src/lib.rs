//! # ysync Core
//!
//! Replicated document model with hybrid logical clocks, YATA sequence
//! integration, and delta synchronization.
//!
//! This crate provides:
//! - Hybrid Logical Clock (HLC) for globally ordered timestamps
//! - Item store and YATA integration for conflict-free sequences
//! - Shared types: last-writer-wins map, array, text, and counters
//! - Document and transaction model with bounded operation history
//! - Delta / full-state synchronization between replicas
//!
//! ```
//! use ysync_core::{Document, TypeKind};
//!
//! let mut a = Document::new("a");
//! a.share("text", TypeKind::Text).unwrap();
//! a.transact(|txn| txn.text_insert("text", 0, "Hello")).unwrap();
//!
//! let mut b = Document::new("b");
//! let update = a.get_update_since(b.hlc_vector());
//! b.apply_update(&update).unwrap();
//! assert_eq!(b.get_text("text").unwrap().to_string(), "Hello");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod array;
pub mod crdt;
pub mod document;
pub mod hlc;
pub mod item;
pub mod map;
pub mod merge;
pub mod operation;
pub mod sync;
pub mod text;
pub mod yata;

pub use array::{Element, YArray};
pub use crdt::{GCounter, PnCounter};
pub use document::{Document, DocumentError, DocumentOptions, SharedType, Transaction};
pub use hlc::{Clock, Hlc, NodeId};
pub use item::{Content, Id, IdRange, Item, ItemSnapshot, TypeKind, TypeRef};
pub use map::YMap;
pub use merge::{SharedData, SharedSnapshot, Snapshot};
pub use operation::{OpPayload, Operation, OperationLog, DEFAULT_HISTORY_LIMIT};
pub use sync::{HlcVector, Update, UpdateError};
pub use text::YText;
pub use yata::{Integration, ItemChain};

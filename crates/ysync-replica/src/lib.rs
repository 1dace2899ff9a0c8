//! # ysync Replica
//!
//! Thread-safe host for one replicated document.
//!
//! ## Architecture
//!
//! A replica combines three concerns:
//! 1. **Mutation**: local transactions under an exclusive document lock
//! 2. **Synchronization**: answering and applying `SyncRequest`/`SyncResponse`
//!    messages from peers under the shared or exclusive lock
//! 3. **Persistence**: every new operation is appended to a `SQLite` log and
//!    periodically folded into a snapshot
//!
//! Transport is left to the caller: messages encode to CBOR or JSON through
//! `ysync-proto`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod persistence;
pub mod replica;

pub use config::{PersistenceConfig, ReplicaConfig};
pub use persistence::{SqliteStore, StoreError};
pub use replica::Replica;

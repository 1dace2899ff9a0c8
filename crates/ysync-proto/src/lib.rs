//! # ysync Protocol
//!
//! Wire envelopes for document synchronization between replicas.
//!
//! ## Messages
//!
//! - `SyncRequest`: the requester's HLC vector for one document
//! - `SyncResponse`: a delta, full state, or no-changes update
//!
//! Both encode as CBOR for transport or JSON for debugging and interop.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;

pub use messages::{MessageError, SyncRequest, SyncResponse};

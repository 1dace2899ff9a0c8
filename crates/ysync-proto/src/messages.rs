//! Protocol messages for document synchronization.

use serde::{Deserialize, Serialize};
use ysync_core::{HlcVector, NodeId, Update, UpdateError};

/// Ask a peer for everything newer than a vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Document identifier
    pub doc_id: String,
    /// Requesting node
    pub node_id: NodeId,
    /// What the requester has already seen
    #[serde(rename = "hlc_vector")]
    pub hlc_vector: HlcVector,
}

impl SyncRequest {
    /// Create a new sync request.
    #[must_use]
    pub fn new(doc_id: impl Into<String>, node_id: NodeId, hlc_vector: HlcVector) -> Self {
        Self {
            doc_id: doc_id.into(),
            node_id,
            hlc_vector,
        }
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        encode_cbor(self)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }

    /// Serialize to JSON text.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|e| MessageError::Serialize(e.to_string()))
    }

    /// Deserialize from JSON text.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        serde_json::from_str(json).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// A peer's answer to a [`SyncRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// Document identifier
    pub doc_id: String,
    /// Delta, full state, or no changes
    pub update: Update,
}

/// Undecoded response whose update is classified separately.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResponse {
    doc_id: String,
    update: serde_json::Value,
}

impl RawResponse {
    fn into_response(self) -> Result<SyncResponse, MessageError> {
        Ok(SyncResponse {
            doc_id: self.doc_id,
            update: Update::from_value(self.update)?,
        })
    }
}

impl SyncResponse {
    /// Create a new response.
    #[must_use]
    pub fn new(doc_id: impl Into<String>, update: Update) -> Self {
        Self {
            doc_id: doc_id.into(),
            update,
        }
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        encode_cbor(self)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Update`] if the update kind is unknown or its
    /// body is malformed, and [`MessageError::Deserialize`] otherwise.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        let raw: RawResponse =
            ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))?;
        raw.into_response()
    }

    /// Serialize to JSON text.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|e| MessageError::Serialize(e.to_string()))
    }

    /// Deserialize from JSON text.
    ///
    /// # Errors
    ///
    /// See [`SyncResponse::from_cbor`].
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let raw: RawResponse =
            serde_json::from_str(json).map_err(|e| MessageError::Deserialize(e.to_string()))?;
        raw.into_response()
    }
}

fn encode_cbor<T: Serialize>(message: &T) -> Result<Vec<u8>, MessageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(message, &mut bytes)
        .map_err(|e| MessageError::Serialize(e.to_string()))?;
    Ok(bytes)
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// The envelope decoded but its update did not
    #[error(transparent)]
    Update(#[from] UpdateError),
}

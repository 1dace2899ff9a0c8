//! Replica runtime: one document behind a lock, with optional persistence.

use crate::config::ReplicaConfig;
use crate::persistence::SqliteStore;
use anyhow::{bail, Context, Result};
use std::sync::{Mutex, PoisonError, RwLock};
use ysync_core::{Document, HlcVector, NodeId, Snapshot, Transaction, Update};
use ysync_proto::{SyncRequest, SyncResponse};

/// Persistence state guarded by one mutex.
struct Storage {
    store: SqliteStore,
    ops_since_snapshot: usize,
}

/// A hosted document replica.
///
/// Mutations take the exclusive lock for their whole transaction; reads and
/// sync requests share the lock.
pub struct Replica {
    config: ReplicaConfig,
    doc: RwLock<Document>,
    storage: Option<Mutex<Storage>>,
}

impl Replica {
    /// Open a replica, restoring persisted state when a store is configured.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be opened or its contents are
    /// unreadable.
    pub fn open(config: ReplicaConfig) -> Result<Self> {
        let store = match config.persistence.store_type.as_str() {
            "sqlite" => Some(
                SqliteStore::open(&config.persistence.db_path)
                    .context("Failed to open SQLite database")?,
            ),
            "memory" => None,
            other => bail!("Unknown store type: {other}"),
        };

        let doc = match &store {
            Some(store) => restore(&config, store)?,
            None => Document::with_options(config.node_id.clone(), config.document),
        };

        tracing::info!(
            node_id = %config.node_id,
            doc_id = %config.doc_id,
            store = %config.persistence.store_type,
            history = doc.history().len(),
            "Replica opened"
        );

        Ok(Self {
            doc: RwLock::new(doc),
            storage: store.map(|store| {
                Mutex::new(Storage {
                    store,
                    ops_since_snapshot: 0,
                })
            }),
            config,
        })
    }

    /// The node this replica runs as.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    /// The hosted document identifier.
    #[must_use]
    pub fn doc_id(&self) -> &str {
        &self.config.doc_id
    }

    /// Run a transaction under the exclusive lock and persist its operations.
    pub fn transact<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> R) -> R {
        let mut doc = self.doc.write().unwrap_or_else(PoisonError::into_inner);
        let before = doc.hlc_vector().clone();
        let result = doc.transact(f);
        self.persist_since(&doc, &before);
        result
    }

    /// Read the document under the shared lock.
    pub fn read<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        let doc = self.doc.read().unwrap_or_else(PoisonError::into_inner);
        f(&doc)
    }

    /// Build a request describing what this replica has seen.
    #[must_use]
    pub fn sync_request(&self) -> SyncRequest {
        let hlc_vector = self.read(|doc| doc.hlc_vector().clone());
        SyncRequest::new(self.config.doc_id.clone(), self.config.node_id.clone(), hlc_vector)
    }

    /// Answer a peer's sync request.
    ///
    /// # Errors
    ///
    /// Returns error if the request targets another document.
    pub fn handle_sync_request(&self, request: &SyncRequest) -> Result<SyncResponse> {
        self.check_doc(&request.doc_id)?;
        let update = self.read(|doc| doc.get_update_since(&request.hlc_vector));

        if let Some(storage) = &self.storage {
            let storage = storage.lock().unwrap_or_else(PoisonError::into_inner);
            record_peer_progress(&storage.store, request);
        }

        tracing::debug!(
            peer = %request.node_id,
            kind = update.kind_name(),
            "Answered sync request"
        );
        Ok(SyncResponse::new(self.config.doc_id.clone(), update))
    }

    /// Apply a peer's sync response.
    ///
    /// # Errors
    ///
    /// Returns error if the response targets another document or its update
    /// is rejected.
    pub fn apply_sync_response(&self, response: &SyncResponse) -> Result<()> {
        self.check_doc(&response.doc_id)?;
        let mut doc = self.doc.write().unwrap_or_else(PoisonError::into_inner);
        let before = doc.hlc_vector().clone();
        doc.apply_update(&response.update)
            .with_context(|| format!("Failed to apply {}", response.update.kind_name()))?;
        self.persist_since(&doc, &before);
        Ok(())
    }

    /// Capture the document state, storing it and compacting the log when a
    /// store is configured.
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot cannot be persisted.
    pub fn snapshot(&self) -> Result<Snapshot> {
        // Writers log under the write lock: keep the read guard until the
        // log is compacted.
        let doc = self.doc.read().unwrap_or_else(PoisonError::into_inner);
        let snapshot = doc.to_snapshot();
        if let Some(storage) = &self.storage {
            let mut storage = storage.lock().unwrap_or_else(PoisonError::into_inner);
            store_snapshot(&mut storage, &self.config.doc_id, &snapshot)
                .context("Failed to persist snapshot")?;
        }
        Ok(snapshot)
    }

    /// The last vector a peer reported, when a store is configured.
    ///
    /// # Errors
    ///
    /// Returns error if the stored vector cannot be read.
    pub fn peer_progress(&self, peer_id: &NodeId) -> Result<Option<HlcVector>> {
        let Some(storage) = &self.storage else {
            return Ok(None);
        };
        let storage = storage.lock().unwrap_or_else(PoisonError::into_inner);
        storage
            .store
            .peer_progress(peer_id, &self.config.doc_id)
            .context("Failed to load peer progress")
    }

    /// Persist whatever changed since `before` was captured.
    fn persist_since(&self, doc: &Document, before: &HlcVector) {
        let Some(storage) = &self.storage else {
            return;
        };
        let mut storage = storage.lock().unwrap_or_else(PoisonError::into_inner);
        let doc_id = self.config.doc_id.as_str();

        match doc.get_update_since(before) {
            Update::DeltaUpdate { operations, .. } => {
                for op in &operations {
                    match storage.store.save_operation(doc_id, op) {
                        Ok(true) => storage.ops_since_snapshot += 1,
                        Ok(false) => {}
                        Err(err) => {
                            tracing::warn!(error = %err, doc_id, hlc = %op.hlc, "Failed to persist operation");
                        }
                    }
                }
                let interval = self.config.persistence.snapshot_interval;
                if interval > 0 && storage.ops_since_snapshot >= interval {
                    if let Err(err) = store_snapshot(&mut storage, doc_id, &doc.to_snapshot()) {
                        tracing::warn!(error = %err, doc_id, "Failed to persist snapshot");
                    }
                }
            }
            Update::FullState { state, .. } => {
                if let Err(err) = store_snapshot(&mut storage, doc_id, &state) {
                    tracing::warn!(error = %err, doc_id, "Failed to persist snapshot");
                }
            }
            Update::NoChanges { .. } => {}
        }
    }

    fn check_doc(&self, doc_id: &str) -> Result<()> {
        if doc_id != self.config.doc_id {
            bail!(
                "Document mismatch: replica hosts {}, message targets {doc_id}",
                self.config.doc_id
            );
        }
        Ok(())
    }
}

/// Store the peer's vector, warning when it went backwards since the last
/// request.
fn record_peer_progress(store: &SqliteStore, request: &SyncRequest) {
    let peer = &request.node_id;
    match store.peer_progress(peer, &request.doc_id) {
        Ok(Some(previous)) if !request.hlc_vector.covers(&previous) => {
            tracing::warn!(peer = %peer, doc_id = %request.doc_id, "Peer vector regressed since its last request");
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(error = %err, peer = %peer, "Failed to load peer progress");
        }
    }
    if let Err(err) = store.update_peer_progress(peer, &request.doc_id, &request.hlc_vector) {
        tracing::warn!(error = %err, peer = %peer, "Failed to update peer progress");
    }
}

fn store_snapshot(
    storage: &mut Storage,
    doc_id: &str,
    snapshot: &Snapshot,
) -> Result<(), crate::persistence::StoreError> {
    storage.store.save_snapshot(doc_id, snapshot)?;
    let compacted = storage
        .store
        .compact_operations(doc_id, &snapshot.hlc_vector)?;
    storage.ops_since_snapshot = 0;
    tracing::debug!(doc_id, compacted, hlc = %snapshot.hlc, "Stored snapshot");
    Ok(())
}

/// Rebuild the document from the latest snapshot plus the logged operations.
fn restore(config: &ReplicaConfig, store: &SqliteStore) -> Result<Document> {
    let doc_id = config.doc_id.as_str();
    let mut doc = match store
        .load_snapshot(doc_id)
        .context("Failed to load snapshot")?
    {
        Some(snapshot) => Document::from_snapshot_with_options(
            config.node_id.clone(),
            &snapshot,
            config.document,
        )
        .context("Stored snapshot is invalid")?,
        None => Document::with_options(config.node_id.clone(), config.document),
    };

    let operations = store
        .load_operations(doc_id)
        .context("Failed to load operation log")?;
    if !operations.is_empty() {
        let replayed = operations.len();
        doc.apply_update(&Update::DeltaUpdate {
            node_id: config.node_id.clone(),
            operations,
            hlc_vector: HlcVector::new(),
        })
        .context("Stored operation log is invalid")?;
        tracing::debug!(doc_id, replayed, "Replayed operation log");
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ysync_core::TypeKind;

    #[test]
    fn rejects_messages_for_other_documents() {
        let replica = Replica::open(ReplicaConfig::in_memory("a", "doc1")).unwrap();
        let request = SyncRequest::new("doc2", NodeId::from("b"), HlcVector::new());
        assert!(replica.handle_sync_request(&request).is_err());
    }

    #[test]
    fn transact_returns_closure_result() {
        let replica = Replica::open(ReplicaConfig::in_memory("a", "doc1")).unwrap();
        replica
            .transact(|txn| {
                txn.share("m", TypeKind::Map)?;
                txn.map_set("m", "k", json!("v"))
            })
            .unwrap();
        assert_eq!(
            replica.read(|doc| doc.to_json("m")),
            Some(json!({"k": "v"}))
        );
        assert_eq!(replica.snapshot().unwrap().shared.len(), 1);
    }

    #[test]
    fn sync_requests_record_peer_progress() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ReplicaConfig::in_memory("a", "doc1");
        config.persistence.store_type = "sqlite".to_string();
        config.persistence.db_path = dir.path().join("replica.db");
        let replica = Replica::open(config).unwrap();
        let peer = NodeId::from("b");
        assert!(replica.peer_progress(&peer).unwrap().is_none());

        let mut seen = HlcVector::new();
        seen.observe(ysync_core::Hlc::new(7, 0, NodeId::from("a")));
        replica
            .handle_sync_request(&SyncRequest::new("doc1", peer.clone(), seen.clone()))
            .unwrap();
        assert_eq!(replica.peer_progress(&peer).unwrap(), Some(seen));

        // A regressed vector is still answered and replaces the stored one.
        replica
            .handle_sync_request(&SyncRequest::new("doc1", peer.clone(), HlcVector::new()))
            .unwrap();
        assert_eq!(replica.peer_progress(&peer).unwrap(), Some(HlcVector::new()));
    }

    #[test]
    fn stale_snapshot_does_not_compact_newer_operations() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ReplicaConfig::in_memory("a", "doc1");
        config.persistence.store_type = "sqlite".to_string();
        config.persistence.db_path = dir.path().join("replica.db");

        {
            let replica = Replica::open(config.clone()).unwrap();
            replica
                .transact(|txn| {
                    txn.share("list", TypeKind::Array)?;
                    txn.array_push("list", json!("early"))
                })
                .unwrap();
            let stale = replica.read(Document::to_snapshot);
            replica
                .transact(|txn| txn.array_push("list", json!("late")))
                .unwrap();

            let storage = replica.storage.as_ref().unwrap();
            let mut storage = storage.lock().unwrap();
            store_snapshot(&mut storage, "doc1", &stale).unwrap();
            assert_eq!(storage.store.operation_count("doc1").unwrap(), 1);
        }

        let reopened = Replica::open(config).unwrap();
        assert_eq!(
            reopened.read(|doc| doc.to_json("list")),
            Some(json!(["early", "late"]))
        );
    }
}

//! `SQLite` persistence layer.
//!
//! Snapshots, operations, and peer vectors are stored as CBOR blobs.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use ysync_core::{HlcVector, NodeId, Operation, Snapshot};

/// `SQLite`-backed persistence store.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r"
            -- Latest full state per document
            CREATE TABLE IF NOT EXISTS doc_snapshots (
                doc_id TEXT PRIMARY KEY,
                snapshot_bytes BLOB NOT NULL,
                snapshot_hlc TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            -- Operations applied since the last snapshot
            CREATE TABLE IF NOT EXISTS op_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                physical_time INTEGER NOT NULL,
                logical_counter INTEGER NOT NULL,
                op_bytes BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(doc_id, node_id, physical_time, logical_counter)
            );

            CREATE INDEX IF NOT EXISTS idx_op_log_doc_id ON op_log(doc_id);

            -- Latest vector each peer reported
            CREATE TABLE IF NOT EXISTS peer_progress (
                peer_id TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                hlc_vector BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (peer_id, doc_id)
            );
            ",
        )?;

        Ok(())
    }

    /// Append an operation to the log. Already-logged operations are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or insert fails.
    pub fn save_operation(&self, doc_id: &str, op: &Operation) -> Result<bool, StoreError> {
        let bytes = encode(op)?;
        let inserted = self.conn.execute(
            r"
            INSERT OR IGNORE INTO op_log
                (doc_id, node_id, physical_time, logical_counter, op_bytes, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            (
                doc_id,
                op.hlc.node_id.as_str(),
                to_i64(op.hlc.physical_time)?,
                op.hlc.logical_counter,
                bytes,
                Utc::now().timestamp(),
            ),
        )?;
        Ok(inserted > 0)
    }

    /// All logged operations for a document, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns error if the query or decoding fails.
    pub fn load_operations(&self, doc_id: &str) -> Result<Vec<Operation>, StoreError> {
        let mut stmt = self.conn.prepare(
            r"
            SELECT op_bytes FROM op_log
            WHERE doc_id = ?1
            ORDER BY id ASC
            ",
        )?;

        let rows = stmt
            .query_map([doc_id], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<rusqlite::Result<Vec<Vec<u8>>>>()?;

        rows.iter().map(|bytes| decode(bytes)).collect()
    }

    /// Number of logged operations for a document.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn operation_count(&self, doc_id: &str) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM op_log WHERE doc_id = ?1",
            [doc_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Replace the snapshot of a document.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or insert fails.
    pub fn save_snapshot(&self, doc_id: &str, snapshot: &Snapshot) -> Result<(), StoreError> {
        let bytes = encode(snapshot)?;
        self.conn.execute(
            r"
            INSERT OR REPLACE INTO doc_snapshots (doc_id, snapshot_bytes, snapshot_hlc, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            (
                doc_id,
                bytes,
                snapshot.hlc.to_string(),
                Utc::now().timestamp(),
            ),
        )?;

        Ok(())
    }

    /// Get the latest snapshot for a document.
    ///
    /// # Errors
    ///
    /// Returns error if the query or decoding fails.
    pub fn load_snapshot(&self, doc_id: &str) -> Result<Option<Snapshot>, StoreError> {
        let bytes: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT snapshot_bytes FROM doc_snapshots WHERE doc_id = ?1",
                [doc_id],
                |row| row.get(0),
            )
            .optional()?;

        bytes.map(|bytes| decode(&bytes)).transpose()
    }

    /// Drop logged operations covered by `covered`, the vector of the
    /// snapshot just stored. Operations from nodes it does not list are kept.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub fn compact_operations(
        &self,
        doc_id: &str,
        covered: &HlcVector,
    ) -> Result<usize, StoreError> {
        let mut stmt = self.conn.prepare(
            r"
            DELETE FROM op_log
            WHERE doc_id = ?1 AND node_id = ?2
              AND (physical_time < ?3 OR (physical_time = ?3 AND logical_counter <= ?4))
            ",
        )?;

        let mut deleted = 0;
        for (node_id, hlc) in covered.iter() {
            deleted += stmt.execute((
                doc_id,
                node_id.as_str(),
                to_i64(hlc.physical_time)?,
                hlc.logical_counter,
            ))?;
        }
        Ok(deleted)
    }

    /// Record the vector a peer reported for a document.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or update fails.
    pub fn update_peer_progress(
        &self,
        peer_id: &NodeId,
        doc_id: &str,
        hlc_vector: &HlcVector,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            r"
            INSERT OR REPLACE INTO peer_progress (peer_id, doc_id, hlc_vector, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            (
                peer_id.as_str(),
                doc_id,
                encode(hlc_vector)?,
                Utc::now().timestamp(),
            ),
        )?;

        Ok(())
    }

    /// The last vector a peer reported for a document.
    ///
    /// # Errors
    ///
    /// Returns error if the query or decoding fails.
    pub fn peer_progress(
        &self,
        peer_id: &NodeId,
        doc_id: &str,
    ) -> Result<Option<HlcVector>, StoreError> {
        let bytes: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT hlc_vector FROM peer_progress WHERE peer_id = ?1 AND doc_id = ?2",
                (peer_id.as_str(), doc_id),
                |row| row.get(0),
            )
            .optional()?;

        bytes.map(|bytes| decode(&bytes)).transpose()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|e| StoreError::Encode(e.to_string()))?;
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Decode(e.to_string()))
}

fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|e| StoreError::Sqlite(rusqlite::Error::ToSqlConversionFailure(Box::new(e))))
}

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database failure
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Value could not be encoded
    #[error("encoding failed: {0}")]
    Encode(String),
    /// Stored bytes could not be decoded
    #[error("decoding failed: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use ysync_core::{Document, TypeKind};

    fn document() -> Document {
        let mut doc = Document::new("a");
        doc.share("list", TypeKind::Array).unwrap();
        doc.transact(|txn| {
            txn.array_push("list", serde_json::json!(1))?;
            txn.array_push("list", serde_json::json!(2))
        })
        .unwrap();
        doc
    }

    #[test]
    fn operations_round_trip_and_deduplicate() {
        let store = SqliteStore::in_memory().unwrap();
        let doc = document();
        let ops: Vec<Operation> = doc.history().iter().cloned().collect();

        for op in &ops {
            assert!(store.save_operation("doc1", op).unwrap());
        }
        assert!(!store.save_operation("doc1", &ops[0]).unwrap());
        assert_eq!(store.operation_count("doc1").unwrap(), 3);

        let loaded = store.load_operations("doc1").unwrap();
        assert_eq!(loaded, ops);
        assert!(store.load_operations("other").unwrap().is_empty());

        assert_eq!(store.compact_operations("doc1", doc.hlc_vector()).unwrap(), 3);
        assert_eq!(store.operation_count("doc1").unwrap(), 0);
    }

    #[test]
    fn compaction_keeps_operations_newer_than_the_snapshot() {
        let store = SqliteStore::in_memory().unwrap();
        let mut doc = document();
        let snapshot = doc.to_snapshot();
        for op in doc.history().iter() {
            store.save_operation("doc1", op).unwrap();
        }

        doc.transact(|txn| txn.array_push("list", serde_json::json!(3)))
            .unwrap();
        let newest = doc.history().iter().last().cloned().unwrap();
        store.save_operation("doc1", &newest).unwrap();

        assert_eq!(
            store
                .compact_operations("doc1", &snapshot.hlc_vector)
                .unwrap(),
            3
        );
        assert_eq!(store.load_operations("doc1").unwrap(), vec![newest]);
    }

    #[test]
    fn snapshot_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.load_snapshot("doc1").unwrap().is_none());

        let doc = document();
        store.save_snapshot("doc1", &doc.to_snapshot()).unwrap();
        let snapshot = store.load_snapshot("doc1").unwrap().unwrap();

        let restored = Document::from_snapshot("b", &snapshot).unwrap();
        assert_eq!(restored.to_json("list"), doc.to_json("list"));
    }

    #[test]
    fn peer_progress_is_replaced() {
        let store = SqliteStore::in_memory().unwrap();
        let peer = NodeId::from("b");
        assert!(store.peer_progress(&peer, "doc1").unwrap().is_none());

        let doc = document();
        store
            .update_peer_progress(&peer, "doc1", &HlcVector::new())
            .unwrap();
        store
            .update_peer_progress(&peer, "doc1", doc.hlc_vector())
            .unwrap();
        assert_eq!(
            store.peer_progress(&peer, "doc1").unwrap().as_ref(),
            Some(doc.hlc_vector())
        );
    }
}

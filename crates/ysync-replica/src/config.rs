//! Replica configuration.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use ysync_core::{DocumentOptions, NodeId, DEFAULT_HISTORY_LIMIT};

/// Replica configuration.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Node identity; random when unset
    pub node_id: NodeId,

    /// Document this replica hosts
    pub doc_id: String,

    /// Document tunables
    pub document: DocumentOptions,

    /// Persistence configuration
    pub persistence: PersistenceConfig,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Persistence type: "sqlite" or "memory"
    pub store_type: String,

    /// Database path (for SQLite)
    pub db_path: PathBuf,

    /// Persisted operations between automatic snapshots; 0 disables them
    pub snapshot_interval: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::random(),
            doc_id: "default".to_string(),
            document: DocumentOptions {
                history_limit: DEFAULT_HISTORY_LIMIT,
            },
            persistence: PersistenceConfig {
                store_type: "sqlite".to_string(),
                db_path: PathBuf::from("./ysync.db"),
                snapshot_interval: 500,
            },
        }
    }
}

impl ReplicaConfig {
    /// In-memory configuration for a node, with no on-disk state.
    #[must_use]
    pub fn in_memory(node_id: impl Into<NodeId>, doc_id: impl Into<String>) -> Self {
        let mut config = Self {
            node_id: node_id.into(),
            doc_id: doc_id.into(),
            ..Self::default()
        };
        config.persistence.store_type = "memory".to_string();
        config
    }

    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `YSYNC_NODE_ID`: Node identifier
    /// - `YSYNC_DOC_ID`: Document identifier
    /// - `YSYNC_HISTORY_LIMIT`: Retained operations per document
    /// - `YSYNC_STORE`: "sqlite" or "memory"
    /// - `YSYNC_DB_PATH`: SQLite database path
    /// - `YSYNC_SNAPSHOT_INTERVAL`: Operations between automatic snapshots
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(id) = lookup("YSYNC_NODE_ID") {
            if id.trim().is_empty() {
                bail!("YSYNC_NODE_ID must not be empty");
            }
            config.node_id = NodeId::new(id);
        }

        if let Some(doc_id) = lookup("YSYNC_DOC_ID") {
            config.doc_id = doc_id;
        }

        if let Some(limit) = lookup("YSYNC_HISTORY_LIMIT") {
            config.document.history_limit =
                limit.parse().context("Invalid YSYNC_HISTORY_LIMIT")?;
        }

        if let Some(store_type) = lookup("YSYNC_STORE") {
            match store_type.as_str() {
                "sqlite" | "memory" => config.persistence.store_type = store_type,
                other => bail!("Invalid YSYNC_STORE: {other} (expected sqlite or memory)"),
            }
        }

        if let Some(db_path) = lookup("YSYNC_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Some(interval) = lookup("YSYNC_SNAPSHOT_INTERVAL") {
            config.persistence.snapshot_interval =
                interval.parse().context("Invalid YSYNC_SNAPSHOT_INTERVAL")?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_without_variables() {
        let config = ReplicaConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.doc_id, "default");
        assert_eq!(config.document.history_limit, DEFAULT_HISTORY_LIMIT);
        assert_eq!(config.persistence.store_type, "sqlite");
        assert!(!config.node_id.as_str().is_empty());
    }

    #[test]
    fn variables_override_defaults() {
        let config = ReplicaConfig::from_lookup(lookup(&[
            ("YSYNC_NODE_ID", "edge-1"),
            ("YSYNC_DOC_ID", "notes"),
            ("YSYNC_HISTORY_LIMIT", "64"),
            ("YSYNC_STORE", "memory"),
            ("YSYNC_SNAPSHOT_INTERVAL", "10"),
        ]))
        .unwrap();

        assert_eq!(config.node_id, NodeId::from("edge-1"));
        assert_eq!(config.doc_id, "notes");
        assert_eq!(config.document.history_limit, 64);
        assert_eq!(config.persistence.store_type, "memory");
        assert_eq!(config.persistence.snapshot_interval, 10);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(ReplicaConfig::from_lookup(lookup(&[("YSYNC_HISTORY_LIMIT", "lots")])).is_err());
        assert!(ReplicaConfig::from_lookup(lookup(&[("YSYNC_STORE", "redis")])).is_err());
        assert!(ReplicaConfig::from_lookup(lookup(&[("YSYNC_NODE_ID", " ")])).is_err());
    }
}

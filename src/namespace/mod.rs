//! Access to table data and cluster metadata.
//!
//! The evaluator only talks to storage through the traits in this module.
//! [`MemoryNamespaceRepo`] and [`ClusterMetadata`] are the in-process
//! implementations used by embedders and tests.

mod memory;
mod router;

pub use memory::{MemoryNamespace, MemoryNamespaceRepo};
pub use router::ShardRouter;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StorageError;
use crate::executor::helpers::compare_values;
use crate::interrupt::Interruptor;

/// Identifier of one table's namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespaceId(pub Uuid);

impl NamespaceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub id: NamespaceId,
    pub primary_key: String,
    pub num_shards: u16,
}

/// Read-only view of the cluster's table catalogue.
pub trait MetadataView: Send + Sync {
    fn lookup_table(&self, db_name: &str, table_name: &str) -> Option<TableMetadata>;
}

/// In-memory table catalogue.
#[derive(Debug, Default)]
pub struct ClusterMetadata {
    tables: RwLock<HashMap<(String, String), TableMetadata>>,
}

impl ClusterMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table, replacing any table of the same name.
    pub fn create_table(
        &self,
        db_name: &str,
        table_name: &str,
        primary_key: &str,
        num_shards: u16,
    ) -> TableMetadata {
        let metadata = TableMetadata {
            id: NamespaceId::generate(),
            primary_key: primary_key.to_string(),
            num_shards: num_shards.max(1),
        };
        tracing::debug!(
            "[SHARD] Created table {}.{} ({} shards, id {})",
            db_name,
            table_name,
            metadata.num_shards,
            metadata.id
        );
        self.tables.write().insert(
            (db_name.to_string(), table_name.to_string()),
            metadata.clone(),
        );
        metadata
    }

    pub fn drop_table(&self, db_name: &str, table_name: &str) -> Option<TableMetadata> {
        self.tables
            .write()
            .remove(&(db_name.to_string(), table_name.to_string()))
    }
}

impl MetadataView for ClusterMetadata {
    fn lookup_table(&self, db_name: &str, table_name: &str) -> Option<TableMetadata> {
        self.tables
            .read()
            .get(&(db_name.to_string(), table_name.to_string()))
            .cloned()
    }
}

/// Inclusive bounds on the primary key; `None` is unbounded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyRange {
    pub lower: Option<Value>,
    pub upper: Option<Value>,
}

impl KeyRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(lower: Option<Value>, upper: Option<Value>) -> Self {
        Self { lower, upper }
    }

    pub fn is_all(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }

    pub fn contains(&self, key: &Value) -> bool {
        let above = self
            .lower
            .as_ref()
            .map_or(true, |lo| compare_values(key, lo).is_ge());
        let below = self
            .upper
            .as_ref()
            .map_or(true, |hi| compare_values(key, hi).is_le());
        above && below
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Store the document unless its key is taken.
    Insert,
    /// Store the document, replacing any document with the same key.
    Upsert,
    /// Remove the document with the same key.
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Replaced,
    Deleted,
    /// A delete found nothing to remove.
    Skipped,
    /// An insert found its key taken.
    Conflict,
}

/// Documents of a table read, pulled one at a time.
pub trait DocumentCursor: Send {
    fn next(&mut self) -> Result<Option<Value>, StorageError>;
}

/// One table's data.
pub trait NamespaceAccess: Send + Sync {
    fn primary_key(&self) -> &str;

    /// Every document whose primary key lies in `range`. The cursor checks
    /// `interruptor` as it reads.
    fn read(
        &self,
        range: KeyRange,
        interruptor: &Interruptor,
    ) -> Result<Box<dyn DocumentCursor>, StorageError>;

    fn point_read(&self, key: &Value) -> Result<Option<Value>, StorageError>;

    /// Apply one write. The document must carry the primary key; for a
    /// delete only the key is consulted.
    fn write(&self, doc: Value, mode: WriteMode) -> Result<WriteOutcome, StorageError>;
}

pub trait NamespaceRepo: Send + Sync {
    fn access(&self, id: &NamespaceId) -> Result<Arc<dyn NamespaceAccess>, StorageError>;
}

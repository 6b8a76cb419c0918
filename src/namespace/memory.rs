//! In-process sharded tables.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use super::{
    DocumentCursor, KeyRange, NamespaceAccess, NamespaceId, NamespaceRepo, ShardRouter,
    TableMetadata, WriteMode, WriteOutcome,
};
use crate::error::StorageError;
use crate::executor::helpers::key_string;
use crate::interrupt::Interruptor;

struct Shard {
    docs: RwLock<BTreeMap<String, Value>>,
    available: AtomicBool,
}

impl Shard {
    fn new() -> Self {
        Self {
            docs: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

/// One table split across a fixed number of shards.
pub struct MemoryNamespace {
    id: NamespaceId,
    primary_key: String,
    shards: Arc<Vec<Shard>>,
    shard_reads: Arc<AtomicUsize>,
    ranged_reads: AtomicUsize,
}

impl MemoryNamespace {
    pub fn new(metadata: &TableMetadata) -> Self {
        let num_shards = metadata.num_shards.max(1);
        Self {
            id: metadata.id,
            primary_key: metadata.primary_key.clone(),
            shards: Arc::new((0..num_shards).map(|_| Shard::new()).collect()),
            shard_reads: Arc::new(AtomicUsize::new(0)),
            ranged_reads: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> NamespaceId {
        self.id
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Number of documents across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.docs.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of shard snapshots taken by reads so far.
    pub fn read_count(&self) -> usize {
        self.shard_reads.load(Ordering::SeqCst)
    }

    /// Number of reads that were given a bounded key range.
    pub fn ranged_read_count(&self) -> usize {
        self.ranged_reads.load(Ordering::SeqCst)
    }

    /// Mark a shard as (un)reachable. Reads and writes touching an
    /// unavailable shard fail.
    pub fn set_shard_available(&self, shard: usize, available: bool) {
        if let Some(s) = self.shards.get(shard) {
            s.available.store(available, Ordering::SeqCst);
        }
    }

    /// Upsert every document of `docs`.
    pub fn load<I: IntoIterator<Item = Value>>(&self, docs: I) -> Result<(), StorageError> {
        for doc in docs {
            self.write(doc, WriteMode::Upsert)?;
        }
        Ok(())
    }

    fn shard_for(&self, key: &Value) -> Result<&Shard, StorageError> {
        let index = ShardRouter::route_value(key, self.shards.len() as u16) as usize;
        let shard = &self.shards[index];
        if !shard.available.load(Ordering::SeqCst) {
            return Err(unavailable(self.id, index));
        }
        Ok(shard)
    }
}

fn unavailable(id: NamespaceId, shard: usize) -> StorageError {
    StorageError::Unavailable(format!("shard {} of {}", shard, id))
}

impl NamespaceAccess for MemoryNamespace {
    fn primary_key(&self) -> &str {
        &self.primary_key
    }

    fn read(
        &self,
        range: KeyRange,
        interruptor: &Interruptor,
    ) -> Result<Box<dyn DocumentCursor>, StorageError> {
        tracing::debug!(
            "[SHARD] Reading {} across {} shards",
            self.id,
            self.shards.len()
        );
        if !range.is_all() {
            self.ranged_reads.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Box::new(ShardCursor {
            id: self.id,
            primary_key: self.primary_key.clone(),
            shards: self.shards.clone(),
            shard_reads: self.shard_reads.clone(),
            range,
            interruptor: interruptor.clone(),
            next_shard: 0,
            buffer: VecDeque::new(),
        }))
    }

    fn point_read(&self, key: &Value) -> Result<Option<Value>, StorageError> {
        let shard = self.shard_for(key)?;
        let doc = shard.docs.read().get(&key_string(key)).cloned();
        Ok(doc)
    }

    fn write(&self, doc: Value, mode: WriteMode) -> Result<WriteOutcome, StorageError> {
        let key = doc
            .get(&self.primary_key)
            .cloned()
            .ok_or_else(|| StorageError::MissingPrimaryKey(self.primary_key.clone()))?;
        let shard = self.shard_for(&key)?;
        let key = key_string(&key);
        let mut docs = shard.docs.write();

        let outcome = match mode {
            WriteMode::Insert => {
                if docs.contains_key(&key) {
                    WriteOutcome::Conflict
                } else {
                    docs.insert(key, doc);
                    WriteOutcome::Inserted
                }
            }
            WriteMode::Upsert => match docs.insert(key, doc) {
                Some(_) => WriteOutcome::Replaced,
                None => WriteOutcome::Inserted,
            },
            WriteMode::Delete => match docs.remove(&key) {
                Some(_) => WriteOutcome::Deleted,
                None => WriteOutcome::Skipped,
            },
        };
        Ok(outcome)
    }
}

/// Walks shards in order, snapshotting each one on first need.
struct ShardCursor {
    id: NamespaceId,
    primary_key: String,
    shards: Arc<Vec<Shard>>,
    shard_reads: Arc<AtomicUsize>,
    range: KeyRange,
    interruptor: Interruptor,
    next_shard: usize,
    buffer: VecDeque<Value>,
}

impl ShardCursor {
    fn snapshot(&self, index: usize) -> Result<VecDeque<Value>, StorageError> {
        let shard = &self.shards[index];
        if !shard.available.load(Ordering::SeqCst) {
            return Err(unavailable(self.id, index));
        }
        self.shard_reads.fetch_add(1, Ordering::SeqCst);
        let docs = shard.docs.read();
        Ok(docs
            .values()
            .filter(|doc| {
                doc.get(&self.primary_key)
                    .is_some_and(|key| self.range.contains(key))
            })
            .cloned()
            .collect())
    }
}

impl DocumentCursor for ShardCursor {
    fn next(&mut self) -> Result<Option<Value>, StorageError> {
        loop {
            if self.interruptor.is_tripped() {
                return Err(StorageError::Interrupted);
            }
            if let Some(doc) = self.buffer.pop_front() {
                return Ok(Some(doc));
            }
            if self.next_shard >= self.shards.len() {
                return Ok(None);
            }
            self.buffer = self.snapshot(self.next_shard)?;
            self.next_shard += 1;
        }
    }
}

/// Registry of in-memory namespaces.
#[derive(Default)]
pub struct MemoryNamespaceRepo {
    namespaces: RwLock<HashMap<NamespaceId, Arc<MemoryNamespace>>>,
}

impl MemoryNamespaceRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the storage for a table registered in the metadata.
    pub fn create_namespace(&self, metadata: &TableMetadata) -> Arc<MemoryNamespace> {
        let namespace = Arc::new(MemoryNamespace::new(metadata));
        self.namespaces
            .write()
            .insert(metadata.id, namespace.clone());
        namespace
    }

    pub fn namespace(&self, id: &NamespaceId) -> Option<Arc<MemoryNamespace>> {
        self.namespaces.read().get(id).cloned()
    }
}

impl NamespaceRepo for MemoryNamespaceRepo {
    fn access(&self, id: &NamespaceId) -> Result<Arc<dyn NamespaceAccess>, StorageError> {
        match self.namespace(id) {
            Some(ns) => Ok(ns as Arc<dyn NamespaceAccess>),
            None => Err(StorageError::TableNotFound(id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::ClusterMetadata;
    use serde_json::json;

    fn table(shards: u16) -> Arc<MemoryNamespace> {
        let metadata = ClusterMetadata::new().create_table("test", "users", "id", shards);
        MemoryNamespaceRepo::new().create_namespace(&metadata)
    }

    fn drain(cursor: &mut dyn DocumentCursor) -> Result<Vec<Value>, StorageError> {
        let mut docs = Vec::new();
        while let Some(doc) = cursor.next()? {
            docs.push(doc);
        }
        Ok(docs)
    }

    #[test]
    fn test_write_modes() {
        let ns = table(2);
        let doc = json!({"id": "a", "v": 1});
        assert_eq!(
            ns.write(doc.clone(), WriteMode::Insert).unwrap(),
            WriteOutcome::Inserted
        );
        assert_eq!(
            ns.write(doc.clone(), WriteMode::Insert).unwrap(),
            WriteOutcome::Conflict
        );
        assert_eq!(
            ns.write(json!({"id": "a", "v": 2}), WriteMode::Upsert)
                .unwrap(),
            WriteOutcome::Replaced
        );
        assert_eq!(ns.point_read(&json!("a")).unwrap(), Some(json!({"id": "a", "v": 2})));
        assert_eq!(
            ns.write(json!({"id": "a"}), WriteMode::Delete).unwrap(),
            WriteOutcome::Deleted
        );
        assert_eq!(
            ns.write(json!({"id": "a"}), WriteMode::Delete).unwrap(),
            WriteOutcome::Skipped
        );
        assert!(ns.is_empty());
    }

    #[test]
    fn test_missing_primary_key() {
        let ns = table(1);
        assert_eq!(
            ns.write(json!({"name": "x"}), WriteMode::Insert),
            Err(StorageError::MissingPrimaryKey("id".to_string()))
        );
    }

    #[test]
    fn test_read_is_lazy_per_shard() {
        let ns = table(4);
        ns.load((0..20).map(|i| json!({"id": i}))).unwrap();

        let mut cursor = ns.read(KeyRange::all(), &Interruptor::new()).unwrap();
        assert_eq!(ns.read_count(), 0);
        assert!(cursor.next().unwrap().is_some());
        assert!(ns.read_count() >= 1);

        let rest = drain(cursor.as_mut()).unwrap();
        assert_eq!(rest.len(), 19);
        assert_eq!(ns.read_count(), 4);
        assert!(cursor.next().unwrap().is_none());
    }

    #[test]
    fn test_read_key_range() {
        let ns = table(3);
        ns.load((0..10).map(|i| json!({"id": i}))).unwrap();
        let mut cursor = ns
            .read(
                KeyRange::between(Some(json!(3)), Some(json!(5))),
                &Interruptor::new(),
            )
            .unwrap();
        let mut ids: Vec<i64> = drain(cursor.as_mut())
            .unwrap()
            .iter()
            .filter_map(|d| d["id"].as_i64())
            .collect();
        ids.sort();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn test_unavailable_shard() {
        let ns = table(1);
        ns.load(vec![json!({"id": 1})]).unwrap();
        ns.set_shard_available(0, false);

        let mut cursor = ns.read(KeyRange::all(), &Interruptor::new()).unwrap();
        assert!(matches!(cursor.next(), Err(StorageError::Unavailable(_))));
        assert!(ns.point_read(&json!(1)).is_err());

        ns.set_shard_available(0, true);
        assert_eq!(ns.point_read(&json!(1)).unwrap(), Some(json!({"id": 1})));
    }

    #[test]
    fn test_interrupted_read() {
        let ns = table(2);
        ns.load((0..4).map(|i| json!({"id": i}))).unwrap();
        let interruptor = Interruptor::new();
        let mut cursor = ns.read(KeyRange::all(), &interruptor).unwrap();
        assert!(cursor.next().unwrap().is_some());
        interruptor.trip();
        assert_eq!(cursor.next(), Err(StorageError::Interrupted));
    }

    #[test]
    fn test_repo_access() {
        let metadata = ClusterMetadata::new().create_table("test", "t", "id", 1);
        let repo = MemoryNamespaceRepo::new();
        assert!(matches!(
            repo.access(&metadata.id),
            Err(StorageError::TableNotFound(_))
        ));
        repo.create_namespace(&metadata);
        assert_eq!(repo.access(&metadata.id).unwrap().primary_key(), "id");
    }
}

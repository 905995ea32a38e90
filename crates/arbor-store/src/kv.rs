//! Ordered byte-keyed tables with batched writes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use tracing::debug;

use arbor_types::ObjectId;

use crate::error::StoreResult;
use crate::object::RevTree;
use crate::traits::ObjectStore;

/// A group of puts applied to one table in a single call.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    puts: Vec<(Vec<u8>, Vec<u8>)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            puts: Vec::with_capacity(capacity),
        }
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.puts.push((key.into(), value.into()));
    }

    pub fn len(&self) -> usize {
        self.puts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty()
    }

    pub fn into_puts(self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.puts
    }
}

/// Named tables of ordered byte keys.
///
/// Later puts to the same key replace earlier ones, including puts that
/// appear later within the same batch.
pub trait KvBackend: Send + Sync {
    fn get(&self, table: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    fn write_batch(&self, table: &str, batch: WriteBatch) -> StoreResult<()>;

    /// Number of distinct keys in `table`.
    fn len(&self, table: &str) -> StoreResult<usize>;

    /// Drop every key in `table`.
    fn clear(&self, table: &str) -> StoreResult<()>;

    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let mut batch = WriteBatch::with_capacity(1);
        batch.put(key, value);
        self.write_batch(table, batch)
    }

    /// Look up several keys at once, preserving the order of `keys`.
    fn multi_get(&self, table: &str, keys: &[&[u8]]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        keys.iter().map(|k| self.get(table, k)).collect()
    }
}

/// In-memory [`KvBackend`] with one `BTreeMap` per table.
#[derive(Default)]
pub struct MemoryKvBackend {
    tables: RwLock<HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKvBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryKvBackend {
    fn get(&self, table: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let tables = self.tables.read().expect("lock poisoned");
        Ok(tables.get(table).and_then(|t| t.get(key).cloned()))
    }

    fn write_batch(&self, table: &str, batch: WriteBatch) -> StoreResult<()> {
        let mut tables = self.tables.write().expect("lock poisoned");
        let entries = tables.entry(table.to_string()).or_default();
        for (key, value) in batch.into_puts() {
            entries.insert(key, value);
        }
        Ok(())
    }

    fn len(&self, table: &str) -> StoreResult<usize> {
        let tables = self.tables.read().expect("lock poisoned");
        Ok(tables.get(table).map_or(0, BTreeMap::len))
    }

    fn clear(&self, table: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().expect("lock poisoned");
        tables.remove(table);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryKvBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read().expect("lock poisoned");
        let mut names: Vec<&String> = tables.keys().collect();
        names.sort();
        f.debug_struct("MemoryKvBackend")
            .field("tables", &names)
            .finish()
    }
}

/// [`ObjectStore`] keeping bincode-encoded trees in one backend table.
pub struct KvObjectStore {
    backend: Arc<dyn KvBackend>,
    table: String,
}

impl KvObjectStore {
    pub const DEFAULT_TABLE: &'static str = "objects";

    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self::with_table(backend, Self::DEFAULT_TABLE)
    }

    pub fn with_table(backend: Arc<dyn KvBackend>, table: impl Into<String>) -> Self {
        Self {
            backend,
            table: table.into(),
        }
    }
}

impl ObjectStore for KvObjectStore {
    fn read_tree(&self, id: &ObjectId) -> StoreResult<Option<RevTree>> {
        match self.backend.get(&self.table, id.as_bytes())? {
            Some(bytes) => RevTree::from_bytes(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn write_tree(&self, tree: &RevTree) -> StoreResult<ObjectId> {
        self.write_trees(std::slice::from_ref(tree))?;
        Ok(tree.id())
    }

    fn exists(&self, id: &ObjectId) -> StoreResult<bool> {
        if *id == RevTree::empty_id() {
            return Ok(true);
        }
        Ok(self.backend.get(&self.table, id.as_bytes())?.is_some())
    }

    fn write_trees(&self, trees: &[RevTree]) -> StoreResult<Vec<ObjectId>> {
        let empty = RevTree::empty_id();
        let mut batch = WriteBatch::with_capacity(trees.len());
        for tree in trees.iter().filter(|t| t.id() != empty) {
            batch.put(tree.id().as_bytes().to_vec(), tree.to_bytes()?);
        }
        if !batch.is_empty() {
            debug!(table = %self.table, count = batch.len(), "writing trees");
            self.backend.write_batch(&self.table, batch)?;
        }
        Ok(trees.iter().map(RevTree::id).collect())
    }
}

//! DAG storage on a [`KvBackend`].
//!
//! Two tables: `trees` maps raw [`TreeId`] bytes to encoded DAG records,
//! `nodes` maps entry-name bytes to encoded [`DagNode`]s. Writes are
//! batched; every read flushes pending writes first, so a handle always
//! observes its own writes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;
use tracing::debug;

use arbor_store::{KvBackend, KvConfig, LogKvBackend, WriteBatch};
use arbor_types::{NodeId, ObjectId, TreeId};

use super::{ensure_complete, reuse_or_create, DagStorageProvider, NodeStore};
use crate::background::BackgroundingNodeStore;
use crate::config::DagConfig;
use crate::dag::Dag;
use crate::error::{DagError, DagResult};
use crate::node::DagNode;
use crate::tree_cache::TreeCache;

const TREES_TABLE: &str = "trees";
const NODES_TABLE: &str = "nodes";

// ---------------------------------------------------------------------------
// KvNodeStore
// ---------------------------------------------------------------------------

/// [`NodeStore`] writing batches of encoded entries to one backend table.
pub struct KvNodeStore {
    backend: Arc<dyn KvBackend>,
    table: String,
    pending: WriteBatch,
    flush_threshold: usize,
    closed: bool,
}

impl KvNodeStore {
    pub fn new(backend: Arc<dyn KvBackend>, table: impl Into<String>, flush_threshold: usize) -> Self {
        Self {
            backend,
            table: table.into(),
            pending: WriteBatch::new(),
            flush_threshold: flush_threshold.max(1),
            closed: false,
        }
    }

    fn check_open(&self) -> DagResult<()> {
        if self.closed {
            Err(DagError::Closed)
        } else {
            Ok(())
        }
    }
}

impl NodeStore for KvNodeStore {
    fn put_all(&mut self, nodes: BTreeMap<NodeId, DagNode>) -> DagResult<()> {
        self.check_open()?;
        for (id, node) in nodes {
            self.pending.put(id.name().as_bytes(), node.to_bytes());
            if self.pending.len() >= self.flush_threshold {
                self.flush()?;
            }
        }
        Ok(())
    }

    fn get(&mut self, id: &NodeId) -> DagResult<Option<DagNode>> {
        self.flush()?;
        self.backend
            .get(&self.table, id.name().as_bytes())?
            .map(|bytes| DagNode::from_bytes(&bytes))
            .transpose()
    }

    fn get_all(&mut self, ids: &BTreeSet<NodeId>) -> DagResult<BTreeMap<NodeId, DagNode>> {
        self.flush()?;
        let keys: Vec<&[u8]> = ids.iter().map(|id| id.name().as_bytes()).collect();
        let values = self.backend.multi_get(&self.table, &keys)?;
        let mut found = BTreeMap::new();
        for (id, value) in ids.iter().zip(values) {
            if let Some(bytes) = value {
                found.insert(id.clone(), DagNode::from_bytes(&bytes)?);
            }
        }
        Ok(found)
    }

    fn len(&mut self) -> DagResult<usize> {
        self.flush()?;
        Ok(self.backend.len(&self.table)?)
    }

    fn flush(&mut self) -> DagResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        let count = batch.len();
        self.backend.write_batch(&self.table, batch)?;
        debug!(table = %self.table, count, "flushed entry batch");
        Ok(())
    }

    fn close(&mut self) -> DagResult<()> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.closed = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PersistentStorageProvider
// ---------------------------------------------------------------------------

/// Provider backed by a key/value store, optionally in a private temporary
/// directory removed on dispose.
pub struct PersistentStorageProvider {
    backend: Arc<dyn KvBackend>,
    cache: Arc<TreeCache>,
    pending: Mutex<BTreeMap<TreeId, Vec<u8>>>,
    flush_threshold: usize,
    nodes: Mutex<Box<dyn NodeStore>>,
    config: DagConfig,
    temp_dir: Mutex<Option<TempDir>>,
    disposed: AtomicBool,
}

fn open_node_store(backend: &Arc<dyn KvBackend>, config: &DagConfig) -> Box<dyn NodeStore> {
    let kv = KvNodeStore::new(
        Arc::clone(backend),
        NODES_TABLE,
        config.persistent_flush_threshold,
    );
    if config.background_writes {
        Box::new(BackgroundingNodeStore::new(kv, config.background_queue_capacity))
    } else {
        Box::new(kv)
    }
}

impl PersistentStorageProvider {
    pub fn new(backend: Arc<dyn KvBackend>, cache: Arc<TreeCache>, config: &DagConfig) -> Self {
        let nodes = open_node_store(&backend, config);
        Self {
            backend,
            cache,
            pending: Mutex::new(BTreeMap::new()),
            flush_threshold: config.persistent_flush_threshold.max(1),
            nodes: Mutex::new(nodes),
            config: config.clone(),
            temp_dir: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Provider over a fresh log-backed store in a temporary directory.
    pub fn temporary(cache: Arc<TreeCache>, config: &DagConfig) -> DagResult<Self> {
        let dir = tempfile::Builder::new().prefix("arbor-dag-").tempdir()?;
        let backend = LogKvBackend::open(dir.path(), KvConfig::default())?;
        debug!(dir = %dir.path().display(), "opened temporary DAG store");
        let provider = Self::new(Arc::new(backend), cache, config);
        *provider.temp_dir.lock() = Some(dir);
        Ok(provider)
    }

    /// Directory of a temporary provider, until it is disposed.
    pub fn temp_path(&self) -> Option<PathBuf> {
        self.temp_dir.lock().as_ref().map(|d| d.path().to_path_buf())
    }

    /// Write every pending DAG and entry value to the backend.
    pub fn flush(&self) -> DagResult<()> {
        let mut pending = self.pending.lock();
        self.flush_trees(&mut pending)?;
        self.nodes.lock().flush()
    }

    /// Drop every entry value, pending or written, and start over with an
    /// empty entry table. DAGs are untouched.
    pub fn discard_nodes(&self) -> DagResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(DagError::Closed);
        }
        let mut nodes = self.nodes.lock();
        let mut old = std::mem::replace(&mut *nodes, open_node_store(&self.backend, &self.config));
        if let Err(err) = old.close() {
            debug!(error = %err, "closing discarded entry store");
        }
        drop(old);
        self.backend.clear(NODES_TABLE)?;
        debug!("discarded entry values");
        Ok(())
    }

    fn flush_trees(&self, pending: &mut BTreeMap<TreeId, Vec<u8>>) -> DagResult<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::with_capacity(pending.len());
        for (id, record) in std::mem::take(pending) {
            batch.put(id.into_bytes(), record);
        }
        let count = batch.len();
        self.backend.write_batch(TREES_TABLE, batch)?;
        debug!(count, "flushed DAG batch");
        Ok(())
    }

    fn read_tree(&self, id: &TreeId) -> DagResult<Option<Dag>> {
        self.backend
            .get(TREES_TABLE, id.as_bytes())?
            .map(|bytes| Dag::from_bytes(id.clone(), &bytes))
            .transpose()
    }
}

impl DagStorageProvider for PersistentStorageProvider {
    fn get_or_create_tree(&self, id: &TreeId, original_tree_id: ObjectId) -> DagResult<Dag> {
        let mut pending = self.pending.lock();
        self.flush_trees(&mut pending)?;
        let existing = self.read_tree(id)?;
        if let Some(dag) = reuse_or_create(existing.as_ref(), id, original_tree_id)? {
            return Ok(dag);
        }
        let mut dag = Dag::new(id.clone(), original_tree_id);
        dag.mark_clean();
        pending.insert(id.clone(), dag.to_bytes());
        Ok(dag)
    }

    fn get_trees(&self, ids: &BTreeSet<TreeId>) -> DagResult<BTreeMap<TreeId, Dag>> {
        {
            let mut pending = self.pending.lock();
            self.flush_trees(&mut pending)?;
        }
        let keys: Vec<&[u8]> = ids.iter().map(TreeId::as_bytes).collect();
        let values = self.backend.multi_get(TREES_TABLE, &keys)?;
        let mut found = BTreeMap::new();
        for (id, value) in ids.iter().zip(values) {
            if let Some(bytes) = value {
                found.insert(id.clone(), Dag::from_bytes(id.clone(), &bytes)?);
            }
        }
        ensure_complete(ids, &found)?;
        Ok(found)
    }

    fn save(&self, dags: BTreeMap<TreeId, Dag>) -> DagResult<()> {
        let mut pending = self.pending.lock();
        for (id, dag) in dags {
            if dag.is_mutated() {
                pending.insert(id, dag.to_bytes());
            }
        }
        if pending.len() >= self.flush_threshold {
            self.flush_trees(&mut pending)?;
        }
        Ok(())
    }

    fn get_node(&self, id: &NodeId) -> DagResult<Option<DagNode>> {
        self.nodes.lock().get(id)
    }

    fn get_nodes(&self, ids: &BTreeSet<NodeId>) -> DagResult<BTreeMap<NodeId, DagNode>> {
        self.nodes.lock().get_all(ids)
    }

    fn save_node(&self, id: NodeId, node: DagNode) -> DagResult<()> {
        self.nodes.lock().put(id, node)
    }

    fn save_nodes(&self, nodes: BTreeMap<NodeId, DagNode>) -> DagResult<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        self.nodes.lock().put_all(nodes)
    }

    fn tree_cache(&self) -> &Arc<TreeCache> {
        &self.cache
    }

    fn trees_len(&self) -> DagResult<usize> {
        let mut pending = self.pending.lock();
        self.flush_trees(&mut pending)?;
        Ok(self.backend.len(TREES_TABLE)?)
    }

    fn nodes_len(&self) -> DagResult<usize> {
        self.nodes.lock().len()
    }

    fn dispose(&self) -> DagResult<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pending.lock().clear();
        let closed = self.nodes.lock().close();
        self.backend.clear(TREES_TABLE)?;
        self.backend.clear(NODES_TABLE)?;
        if let Some(dir) = self.temp_dir.lock().take() {
            debug!(dir = %dir.path().display(), "removing temporary DAG store");
            dir.close()?;
        }
        closed
    }
}

impl std::fmt::Debug for PersistentStorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStorageProvider")
            .field("pending", &self.pending.lock().len())
            .field("temp_dir", &self.temp_path())
            .finish()
    }
}

//! Tiered storage: shallow DAGs on the heap, deep ones on disk.
//!
//! DAGs are routed by depth. Entry values start on the heap; once more than
//! [`DagConfig::heap_node_threshold`] are held, all of them move to the
//! persistent side under a lock and every later value goes there too. The
//! swap happens at most once per provider. A failed swap discards the
//! partially written values and keeps the persistent DAGs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use arbor_types::{NodeId, ObjectId, TreeId};

use super::{ensure_complete, DagStorageProvider, HeapStorageProvider, PersistentStorageProvider};
use crate::config::DagConfig;
use crate::dag::Dag;
use crate::error::{DagError, DagResult};
use crate::node::DagNode;
use crate::tree_cache::TreeCache;

/// Builds the persistent side on first use.
pub type PersistentFactory =
    Box<dyn Fn(Arc<TreeCache>, &DagConfig) -> DagResult<PersistentStorageProvider> + Send + Sync>;

pub struct CachingStorageProvider {
    heap: HeapStorageProvider,
    persistent: Mutex<Option<Arc<PersistentStorageProvider>>>,
    factory: PersistentFactory,
    cache: Arc<TreeCache>,
    config: DagConfig,
    swapped: AtomicBool,
    swap_lock: Mutex<()>,
    disposed: AtomicBool,
}

impl CachingStorageProvider {
    /// Tiered provider whose persistent side lives in a temporary directory.
    pub fn new(cache: Arc<TreeCache>, config: DagConfig) -> Self {
        Self::with_factory(
            cache,
            config,
            Box::new(|cache: Arc<TreeCache>, config: &DagConfig| {
                PersistentStorageProvider::temporary(cache, config)
            }),
        )
    }

    pub fn with_factory(cache: Arc<TreeCache>, config: DagConfig, factory: PersistentFactory) -> Self {
        Self {
            heap: HeapStorageProvider::new(Arc::clone(&cache)),
            persistent: Mutex::new(None),
            factory,
            cache,
            config,
            swapped: AtomicBool::new(false),
            swap_lock: Mutex::new(()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Whether entry values have moved to persistent storage.
    pub fn is_swapped(&self) -> bool {
        self.swapped.load(Ordering::Acquire)
    }

    /// Whether the persistent side has been created.
    pub fn has_persistent(&self) -> bool {
        self.persistent.lock().is_some()
    }

    fn on_heap(&self, id: &TreeId) -> bool {
        id.depth_length() <= self.config.heap_depth_threshold
    }

    fn persistent(&self) -> DagResult<Arc<PersistentStorageProvider>> {
        let mut slot = self.persistent.lock();
        if self.disposed.load(Ordering::Acquire) {
            return Err(DagError::Closed);
        }
        if let Some(p) = slot.as_ref() {
            return Ok(Arc::clone(p));
        }
        let p = Arc::new((self.factory)(Arc::clone(&self.cache), &self.config)?);
        debug!("created persistent DAG storage");
        *slot = Some(Arc::clone(&p));
        Ok(p)
    }

    fn open_persistent(&self) -> Option<Arc<PersistentStorageProvider>> {
        self.persistent.lock().clone()
    }

    /// Persistent side holding entry values after the swap.
    fn swapped_nodes(&self) -> DagResult<Arc<PersistentStorageProvider>> {
        self.open_persistent().ok_or(DagError::Closed)
    }

    /// Move every heap entry value to the persistent side. Caller holds
    /// `swap_lock`.
    fn swap_nodes(&self) -> DagResult<()> {
        let persistent = self.persistent()?;
        let snapshot = self.heap.snapshot_nodes();
        let count = snapshot.len();
        let migrated = persistent
            .save_nodes(snapshot)
            .and_then(|()| persistent.flush());
        if let Err(err) = migrated {
            warn!(error = %err, count, "entry value migration failed");
            if let Err(discard_err) = persistent.discard_nodes() {
                warn!(error = %discard_err, "discarding partially migrated entry values");
            }
            return Err(err);
        }
        self.swapped.store(true, Ordering::Release);
        self.heap.clear_nodes();
        info!(count, "moved entry values to persistent storage");
        Ok(())
    }

    fn after_heap_write(&self) -> DagResult<()> {
        if self.heap.node_count() > self.config.heap_node_threshold {
            self.swap_nodes()?;
        }
        Ok(())
    }
}

impl DagStorageProvider for CachingStorageProvider {
    fn get_or_create_tree(&self, id: &TreeId, original_tree_id: ObjectId) -> DagResult<Dag> {
        if self.on_heap(id) {
            self.heap.get_or_create_tree(id, original_tree_id)
        } else {
            self.persistent()?.get_or_create_tree(id, original_tree_id)
        }
    }

    fn get_trees(&self, ids: &BTreeSet<TreeId>) -> DagResult<BTreeMap<TreeId, Dag>> {
        let mut found = self.heap.find_trees(ids);
        if found.len() == ids.len() {
            return Ok(found);
        }
        if let Some(persistent) = self.open_persistent() {
            let remaining: BTreeSet<TreeId> = ids
                .iter()
                .filter(|id| !found.contains_key(*id))
                .cloned()
                .collect();
            found.extend(persistent.get_trees(&remaining)?);
        }
        ensure_complete(ids, &found)?;
        Ok(found)
    }

    fn save(&self, dags: BTreeMap<TreeId, Dag>) -> DagResult<()> {
        let (shallow, deep): (BTreeMap<_, _>, BTreeMap<_, _>) =
            dags.into_iter().partition(|(id, _)| self.on_heap(id));
        self.heap.save(shallow)?;
        if !deep.is_empty() {
            self.persistent()?.save(deep)?;
        }
        Ok(())
    }

    fn get_node(&self, id: &NodeId) -> DagResult<Option<DagNode>> {
        if let Some(node) = self.heap.get_node(id)? {
            return Ok(Some(node));
        }
        match self.open_persistent() {
            Some(persistent) if self.is_swapped() => persistent.get_node(id),
            _ => Ok(None),
        }
    }

    fn get_nodes(&self, ids: &BTreeSet<NodeId>) -> DagResult<BTreeMap<NodeId, DagNode>> {
        let mut found = self.heap.get_nodes(ids)?;
        if found.len() == ids.len() || !self.is_swapped() {
            return Ok(found);
        }
        if let Some(persistent) = self.open_persistent() {
            let remaining: BTreeSet<NodeId> = ids
                .iter()
                .filter(|id| !found.contains_key(*id))
                .cloned()
                .collect();
            found.extend(persistent.get_nodes(&remaining)?);
        }
        Ok(found)
    }

    fn save_node(&self, id: NodeId, node: DagNode) -> DagResult<()> {
        if self.is_swapped() {
            return self.swapped_nodes()?.save_node(id, node);
        }
        let _guard = self.swap_lock.lock();
        if self.is_swapped() {
            return self.swapped_nodes()?.save_node(id, node);
        }
        self.heap.save_node(id, node)?;
        self.after_heap_write()
    }

    fn save_nodes(&self, nodes: BTreeMap<NodeId, DagNode>) -> DagResult<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        if self.is_swapped() {
            return self.swapped_nodes()?.save_nodes(nodes);
        }
        let _guard = self.swap_lock.lock();
        if self.is_swapped() {
            return self.swapped_nodes()?.save_nodes(nodes);
        }
        self.heap.save_nodes(nodes)?;
        self.after_heap_write()
    }

    fn tree_cache(&self) -> &Arc<TreeCache> {
        &self.cache
    }

    fn trees_len(&self) -> DagResult<usize> {
        let deep = match self.open_persistent() {
            Some(p) => p.trees_len()?,
            None => 0,
        };
        Ok(self.heap.trees_len()? + deep)
    }

    fn nodes_len(&self) -> DagResult<usize> {
        let persisted = match self.open_persistent() {
            Some(p) if self.is_swapped() => p.nodes_len()?,
            _ => 0,
        };
        Ok(self.heap.node_count() + persisted)
    }

    fn dispose(&self) -> DagResult<()> {
        self.heap.dispose()?;
        let persistent = {
            let mut slot = self.persistent.lock();
            self.disposed.store(true, Ordering::Release);
            slot.take()
        };
        if let Some(p) = persistent {
            p.dispose()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CachingStorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingStorageProvider")
            .field("heap", &self.heap)
            .field("persistent", &self.has_persistent())
            .field("swapped", &self.is_swapped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::tree_cache;
    use arbor_store::{KvBackend, MemoryKvBackend, Node, StoreError, StoreResult, WriteBatch};

    fn config() -> DagConfig {
        DagConfig {
            heap_node_threshold: 10,
            persistent_flush_threshold: 4,
            ..DagConfig::default()
        }
    }

    fn memory_factory() -> PersistentFactory {
        Box::new(|cache: Arc<TreeCache>, config: &DagConfig| {
            Ok(PersistentStorageProvider::new(
                Arc::new(MemoryKvBackend::new()),
                cache,
                config,
            ))
        })
    }

    fn feature(name: &str) -> DagNode {
        DagNode::direct(Node::feature(name, ObjectId::from_bytes(name.as_bytes())))
    }

    struct FailingBackend;

    impl KvBackend for FailingBackend {
        fn get(&self, _table: &str, _key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
            Ok(None)
        }

        fn write_batch(&self, _table: &str, _batch: WriteBatch) -> StoreResult<()> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }

        fn len(&self, _table: &str) -> StoreResult<usize> {
            Ok(0)
        }

        fn clear(&self, _table: &str) -> StoreResult<()> {
            Ok(())
        }
    }

    /// Memory backend whose entry table rejects every write.
    struct NodesFailBackend(MemoryKvBackend);

    impl KvBackend for NodesFailBackend {
        fn get(&self, table: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
            self.0.get(table, key)
        }

        fn write_batch(&self, table: &str, batch: WriteBatch) -> StoreResult<()> {
            if table == "nodes" {
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
            self.0.write_batch(table, batch)
        }

        fn len(&self, table: &str) -> StoreResult<usize> {
            self.0.len(table)
        }

        fn clear(&self, table: &str) -> StoreResult<()> {
            self.0.clear(table)
        }
    }

    fn batch(count: usize) -> BTreeMap<NodeId, DagNode> {
        (0..count)
            .map(|i| {
                let name = format!("f{i}");
                (NodeId::canonical(name.as_str()), feature(&name))
            })
            .collect()
    }

    // ----------------------------------------------------------
    // Tree routing
    // ----------------------------------------------------------

    #[test]
    fn shallow_trees_stay_on_heap() {
        let p = CachingStorageProvider::with_factory(tree_cache(), config(), memory_factory());
        p.get_or_create_tree(&TreeId::new(vec![1, 2, 3]), ObjectId::NULL).unwrap();
        assert!(!p.has_persistent());

        let deep = TreeId::new(vec![1, 2, 3, 4]);
        let mut dag = p.get_or_create_tree(&deep, ObjectId::NULL).unwrap();
        assert!(p.has_persistent());
        dag.set_changed();
        p.save(BTreeMap::from([(deep.clone(), dag)])).unwrap();

        let ids = BTreeSet::from([TreeId::new(vec![1, 2, 3]), deep.clone()]);
        let found = p.get_trees(&ids).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[&deep].state(), crate::dag::DagState::Changed);
        assert_eq!(p.trees_len().unwrap(), 2);
    }

    #[test]
    fn missing_trees_fail_without_persistent_side() {
        let p = CachingStorageProvider::with_factory(tree_cache(), config(), memory_factory());
        let err = p.get_trees(&BTreeSet::from([TreeId::new(vec![7])])).unwrap_err();
        assert!(matches!(err, DagError::MissingTrees { .. }));
    }

    // ----------------------------------------------------------
    // Entry swap
    // ----------------------------------------------------------

    #[test]
    fn values_move_to_disk_past_threshold() {
        let p = CachingStorageProvider::with_factory(tree_cache(), config(), memory_factory());
        for i in 0..10 {
            let name = format!("f{i}");
            p.save_node(NodeId::canonical(name.as_str()), feature(&name)).unwrap();
        }
        assert!(!p.is_swapped());

        p.save_node(NodeId::canonical("f10"), feature("f10")).unwrap();
        assert!(p.is_swapped());
        assert_eq!(p.heap.node_count(), 0);
        assert_eq!(p.nodes_len().unwrap(), 11);

        p.save_node(NodeId::canonical("late"), feature("late")).unwrap();
        assert_eq!(p.heap.node_count(), 0);
        assert_eq!(p.get_node(&NodeId::canonical("f3")).unwrap(), Some(feature("f3")));
        let ids = BTreeSet::from([NodeId::canonical("f0"), NodeId::canonical("late")]);
        assert_eq!(p.get_nodes(&ids).unwrap().len(), 2);
    }

    #[test]
    fn failed_migration_keeps_heap_values() {
        let factory: PersistentFactory = Box::new(|cache: Arc<TreeCache>, config: &DagConfig| {
            let config = DagConfig {
                background_writes: false,
                ..config.clone()
            };
            Ok(PersistentStorageProvider::new(Arc::new(FailingBackend), cache, &config))
        });
        let p = CachingStorageProvider::with_factory(tree_cache(), config(), factory);
        let batch: BTreeMap<NodeId, DagNode> = (0..11)
            .map(|i| {
                let name = format!("f{i}");
                (NodeId::canonical(name.as_str()), feature(&name))
            })
            .collect();
        let err = p.save_nodes(batch).unwrap_err();
        assert!(matches!(err, DagError::Store(StoreError::Io(_))));
        assert!(!p.is_swapped());
        assert!(p.has_persistent());
        assert_eq!(p.heap.node_count(), 11);
        assert_eq!(p.get_node(&NodeId::canonical("f4")).unwrap(), Some(feature("f4")));
    }

    #[test]
    fn failed_migration_keeps_deep_trees() {
        let factory: PersistentFactory = Box::new(|cache: Arc<TreeCache>, config: &DagConfig| {
            Ok(PersistentStorageProvider::new(
                Arc::new(NodesFailBackend(MemoryKvBackend::new())),
                cache,
                config,
            ))
        });
        let p = CachingStorageProvider::with_factory(tree_cache(), config(), factory);
        let deep = TreeId::new(vec![1, 2, 3, 4]);
        let mut dag = p.get_or_create_tree(&deep, ObjectId::NULL).unwrap();
        dag.set_changed();
        p.save(BTreeMap::from([(deep.clone(), dag)])).unwrap();
        assert_eq!(p.trees_len().unwrap(), 1);

        assert!(p.save_nodes(batch(11)).is_err());
        assert!(!p.is_swapped());
        assert_eq!(p.trees_len().unwrap(), 1);
        let found = p.get_trees(&BTreeSet::from([deep.clone()])).unwrap();
        assert_eq!(found[&deep].state(), crate::dag::DagState::Changed);
        assert_eq!(p.nodes_len().unwrap(), 11);
        assert_eq!(p.get_node(&NodeId::canonical("f9")).unwrap(), Some(feature("f9")));
    }

    #[test]
    fn writes_after_dispose_are_refused() {
        let p = CachingStorageProvider::with_factory(tree_cache(), config(), memory_factory());
        p.save_nodes(batch(11)).unwrap();
        assert!(p.is_swapped());
        p.dispose().unwrap();

        let err = p.save_node(NodeId::canonical("late"), feature("late")).unwrap_err();
        assert!(matches!(err, DagError::Closed));
        let err = p.save_nodes(batch(2)).unwrap_err();
        assert!(matches!(err, DagError::Closed));
        let err = p
            .get_or_create_tree(&TreeId::new(vec![1, 2, 3, 4]), ObjectId::NULL)
            .unwrap_err();
        assert!(matches!(err, DagError::Closed));
        assert!(!p.has_persistent());
    }

    #[test]
    fn dispose_releases_both_sides() {
        let p = CachingStorageProvider::new(tree_cache(), config());
        let deep = TreeId::new(vec![0, 0, 0, 0, 0]);
        p.get_or_create_tree(&deep, ObjectId::NULL).unwrap();
        assert!(p.has_persistent());
        p.dispose().unwrap();
        assert!(!p.has_persistent());
        assert_eq!(p.trees_len().unwrap(), 0);
    }
}

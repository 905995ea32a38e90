//! Storage of DAGs and entry values.
//!
//! A [`DagStorageProvider`] holds the DAGs of one clustering session keyed
//! by [`TreeId`], and the entry values keyed by [`NodeId`]. Three providers
//! exist:
//!
//! - [`HeapStorageProvider`] -- everything in memory, no eviction
//! - [`PersistentStorageProvider`] -- batched writes to a [`KvBackend`](arbor_store::KvBackend)
//! - [`CachingStorageProvider`] -- shallow DAGs on the heap, deep ones on
//!   disk, entry values swapped to disk past a size threshold
//!
//! DAGs are handed out as owned copies. A provider only sees a mutation
//! once the copy is passed back through [`DagStorageProvider::save`].

mod caching;
mod heap;
mod persistent;

pub use caching::{CachingStorageProvider, PersistentFactory};
pub use heap::HeapStorageProvider;
pub use persistent::{KvNodeStore, PersistentStorageProvider};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arbor_store::{Node, RevTree};
use arbor_types::{NodeId, ObjectId, TreeId};

use crate::dag::Dag;
use crate::error::{DagError, DagResult};
use crate::node::DagNode;
use crate::tree_cache::TreeCache;

/// Backing store for the DAGs and entry values of a clustering session.
pub trait DagStorageProvider: Send + Sync {
    /// Fetch the DAG stored under `id`, creating it if absent.
    ///
    /// Asking for an existing id with a different original tree is an
    /// error: the id is already taken by another subtree.
    fn get_or_create_tree(&self, id: &TreeId, original_tree_id: ObjectId) -> DagResult<Dag>;

    /// Fetch every requested DAG. Any missing id fails the whole call.
    fn get_trees(&self, ids: &BTreeSet<TreeId>) -> DagResult<BTreeMap<TreeId, Dag>>;

    /// Persist the mutated DAGs of `dags`; clean ones are skipped.
    fn save(&self, dags: BTreeMap<TreeId, Dag>) -> DagResult<()>;

    fn get_node(&self, id: &NodeId) -> DagResult<Option<DagNode>>;

    /// Values of the requested ids that exist.
    fn get_nodes(&self, ids: &BTreeSet<NodeId>) -> DagResult<BTreeMap<NodeId, DagNode>>;

    fn save_node(&self, id: NodeId, node: DagNode) -> DagResult<()>;

    fn save_nodes(&self, nodes: BTreeMap<NodeId, DagNode>) -> DagResult<()>;

    fn tree_cache(&self) -> &Arc<TreeCache>;

    /// Number of DAGs held.
    fn trees_len(&self) -> DagResult<usize>;

    /// Number of entry values held.
    fn nodes_len(&self) -> DagResult<usize>;

    /// Release everything this provider holds.
    fn dispose(&self) -> DagResult<()>;

    /// Load an original tree through the tree cache.
    fn get_tree(&self, id: &ObjectId) -> DagResult<Arc<RevTree>> {
        self.tree_cache().tree(id)
    }

    /// Fetch and materialize entry values. Ids without a value are absent
    /// from the result.
    fn resolve_nodes(&self, ids: &BTreeSet<NodeId>) -> DagResult<BTreeMap<NodeId, Node>> {
        let cache = self.tree_cache();
        self.get_nodes(ids)?
            .into_iter()
            .map(|(id, node)| Ok((id, node.resolve(cache)?)))
            .collect()
    }
}

/// Key/value store of entry values.
///
/// Takes `&mut self` throughout: a node store has a single writer.
pub trait NodeStore: Send {
    fn put_all(&mut self, nodes: BTreeMap<NodeId, DagNode>) -> DagResult<()>;

    fn get(&mut self, id: &NodeId) -> DagResult<Option<DagNode>>;

    fn get_all(&mut self, ids: &BTreeSet<NodeId>) -> DagResult<BTreeMap<NodeId, DagNode>>;

    fn len(&mut self) -> DagResult<usize>;

    /// Make every accepted put visible to the underlying storage.
    fn flush(&mut self) -> DagResult<()>;

    fn close(&mut self) -> DagResult<()>;

    fn put(&mut self, id: NodeId, node: DagNode) -> DagResult<()> {
        self.put_all(BTreeMap::from([(id, node)]))
    }
}

impl<S: NodeStore + ?Sized> NodeStore for Box<S> {
    fn put_all(&mut self, nodes: BTreeMap<NodeId, DagNode>) -> DagResult<()> {
        (**self).put_all(nodes)
    }

    fn get(&mut self, id: &NodeId) -> DagResult<Option<DagNode>> {
        (**self).get(id)
    }

    fn get_all(&mut self, ids: &BTreeSet<NodeId>) -> DagResult<BTreeMap<NodeId, DagNode>> {
        (**self).get_all(ids)
    }

    fn len(&mut self) -> DagResult<usize> {
        (**self).len()
    }

    fn flush(&mut self) -> DagResult<()> {
        (**self).flush()
    }

    fn close(&mut self) -> DagResult<()> {
        (**self).close()
    }
}

/// Shared get-or-create rule: reuse a compatible DAG, reject a conflicting one.
pub(crate) fn reuse_or_create(
    existing: Option<&Dag>,
    id: &TreeId,
    original_tree_id: ObjectId,
) -> DagResult<Option<Dag>> {
    let requested = if original_tree_id.is_null() {
        RevTree::empty_id()
    } else {
        original_tree_id
    };
    match existing {
        None => Ok(None),
        Some(dag) if dag.original_tree_id() == requested => {
            let mut copy = dag.clone();
            copy.mark_clean();
            Ok(Some(copy))
        }
        Some(dag) => Err(DagError::DuplicateTree {
            id: id.clone(),
            existing: dag.original_tree_id(),
            requested,
        }),
    }
}

/// Fail a batch fetch that did not resolve every id.
pub(crate) fn ensure_complete(
    ids: &BTreeSet<TreeId>,
    found: &BTreeMap<TreeId, Dag>,
) -> DagResult<()> {
    if found.len() == ids.len() {
        return Ok(());
    }
    let missing: Vec<TreeId> = ids
        .iter()
        .filter(|id| !found.contains_key(*id))
        .cloned()
        .collect();
    Err(DagError::MissingTrees {
        requested: ids.len(),
        missing,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use arbor_store::{InMemoryObjectStore, ObjectStore};

    use crate::tree_cache::TreeCache;

    pub fn tree_cache() -> Arc<TreeCache> {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        Arc::new(TreeCache::new(store, 64).unwrap())
    }
}

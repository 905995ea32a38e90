//! In-memory DAG storage.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use arbor_types::{NodeId, ObjectId, TreeId};

use super::{ensure_complete, reuse_or_create, DagStorageProvider};
use crate::dag::Dag;
use crate::error::DagResult;
use crate::node::DagNode;
use crate::tree_cache::TreeCache;

/// Ordered DAG map plus a concurrent entry-value map. Never evicts.
pub struct HeapStorageProvider {
    trees: RwLock<BTreeMap<TreeId, Dag>>,
    nodes: DashMap<NodeId, DagNode>,
    cache: Arc<TreeCache>,
}

impl HeapStorageProvider {
    pub fn new(cache: Arc<TreeCache>) -> Self {
        Self {
            trees: RwLock::new(BTreeMap::new()),
            nodes: DashMap::new(),
            cache,
        }
    }

    /// Copy of every stored entry value.
    pub(crate) fn snapshot_nodes(&self) -> BTreeMap<NodeId, DagNode> {
        self.nodes
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub(crate) fn clear_nodes(&self) {
        self.nodes.clear();
    }

    pub(crate) fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Stored DAGs among `ids`, without failing on misses.
    pub(crate) fn find_trees(&self, ids: &BTreeSet<TreeId>) -> BTreeMap<TreeId, Dag> {
        let trees = self.trees.read();
        ids.iter()
            .filter_map(|id| trees.get(id).map(|dag| (id.clone(), dag.clone())))
            .collect()
    }
}

impl DagStorageProvider for HeapStorageProvider {
    fn get_or_create_tree(&self, id: &TreeId, original_tree_id: ObjectId) -> DagResult<Dag> {
        let mut trees = self.trees.write();
        if let Some(dag) = reuse_or_create(trees.get(id), id, original_tree_id)? {
            return Ok(dag);
        }
        let mut dag = Dag::new(id.clone(), original_tree_id);
        dag.mark_clean();
        trees.insert(id.clone(), dag.clone());
        Ok(dag)
    }

    fn get_trees(&self, ids: &BTreeSet<TreeId>) -> DagResult<BTreeMap<TreeId, Dag>> {
        let found = self.find_trees(ids);
        ensure_complete(ids, &found)?;
        Ok(found)
    }

    fn save(&self, dags: BTreeMap<TreeId, Dag>) -> DagResult<()> {
        let mut trees = self.trees.write();
        for (id, mut dag) in dags {
            if dag.is_mutated() {
                dag.mark_clean();
                trees.insert(id, dag);
            }
        }
        Ok(())
    }

    fn get_node(&self, id: &NodeId) -> DagResult<Option<DagNode>> {
        Ok(self.nodes.get(id).map(|e| e.value().clone()))
    }

    fn get_nodes(&self, ids: &BTreeSet<NodeId>) -> DagResult<BTreeMap<NodeId, DagNode>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.nodes.get(id).map(|e| (id.clone(), e.value().clone())))
            .collect())
    }

    fn save_node(&self, id: NodeId, node: DagNode) -> DagResult<()> {
        self.nodes.insert(id, node);
        Ok(())
    }

    fn save_nodes(&self, nodes: BTreeMap<NodeId, DagNode>) -> DagResult<()> {
        for (id, node) in nodes {
            self.nodes.insert(id, node);
        }
        Ok(())
    }

    fn tree_cache(&self) -> &Arc<TreeCache> {
        &self.cache
    }

    fn trees_len(&self) -> DagResult<usize> {
        Ok(self.trees.read().len())
    }

    fn nodes_len(&self) -> DagResult<usize> {
        Ok(self.nodes.len())
    }

    fn dispose(&self) -> DagResult<()> {
        self.trees.write().clear();
        self.nodes.clear();
        Ok(())
    }
}

impl std::fmt::Debug for HeapStorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapStorageProvider")
            .field("trees", &self.trees.read().len())
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DagError;
    use crate::storage::test_support::tree_cache;
    use arbor_store::{Node, RevTree};

    fn provider() -> HeapStorageProvider {
        HeapStorageProvider::new(tree_cache())
    }

    // ----------------------------------------------------------
    // Trees
    // ----------------------------------------------------------

    #[test]
    fn get_or_create_reuses_existing() {
        let p = provider();
        let id = TreeId::new(vec![1]);
        let first = p.get_or_create_tree(&id, ObjectId::NULL).unwrap();
        let again = p.get_or_create_tree(&id, RevTree::empty_id()).unwrap();
        assert_eq!(first, again);
        assert!(!again.is_mutated());
        assert_eq!(p.trees_len().unwrap(), 1);
    }

    #[test]
    fn conflicting_original_is_rejected() {
        let p = provider();
        let id = TreeId::new(vec![1]);
        p.get_or_create_tree(&id, ObjectId::from_bytes(b"a")).unwrap();
        let err = p.get_or_create_tree(&id, ObjectId::from_bytes(b"b")).unwrap_err();
        assert!(matches!(err, DagError::DuplicateTree { .. }));
    }

    #[test]
    fn handed_out_copies_are_independent() {
        let p = provider();
        let id = TreeId::root();
        let mut dag = p.get_or_create_tree(&id, ObjectId::NULL).unwrap();
        dag.add_child(NodeId::canonical("x"));
        let stored = p.get_trees(&BTreeSet::from([id.clone()])).unwrap();
        assert_eq!(stored[&id].num_children(), 0);

        p.save(BTreeMap::from([(id.clone(), dag)])).unwrap();
        let stored = p.get_trees(&BTreeSet::from([id.clone()])).unwrap();
        assert_eq!(stored[&id].num_children(), 1);
        assert!(!stored[&id].is_mutated());
    }

    #[test]
    fn clean_dags_are_not_saved() {
        let p = provider();
        let id = TreeId::root();
        let mut dag = Dag::new(id.clone(), ObjectId::NULL);
        dag.add_child(NodeId::canonical("x"));
        dag.mark_clean();
        p.save(BTreeMap::from([(id, dag)])).unwrap();
        assert_eq!(p.trees_len().unwrap(), 0);
    }

    #[test]
    fn missing_trees_fail_the_batch() {
        let p = provider();
        p.get_or_create_tree(&TreeId::new(vec![0]), ObjectId::NULL).unwrap();
        let ids = BTreeSet::from([TreeId::new(vec![0]), TreeId::new(vec![1])]);
        match p.get_trees(&ids).unwrap_err() {
            DagError::MissingTrees { requested, missing } => {
                assert_eq!(requested, 2);
                assert_eq!(missing, vec![TreeId::new(vec![1])]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    // ----------------------------------------------------------
    // Nodes
    // ----------------------------------------------------------

    #[test]
    fn nodes_roundtrip_and_resolve() {
        let p = provider();
        let node = Node::feature("f", ObjectId::from_bytes(b"f"));
        let id = NodeId::canonical("f");
        p.save_node(id.clone(), DagNode::direct(node.clone())).unwrap();
        assert_eq!(p.get_node(&id).unwrap(), Some(DagNode::direct(node.clone())));

        let ids = BTreeSet::from([id.clone(), NodeId::canonical("missing")]);
        let resolved = p.resolve_nodes(&ids).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[&id], node);
    }

    #[test]
    fn dispose_clears_everything() {
        let p = provider();
        p.get_or_create_tree(&TreeId::root(), ObjectId::NULL).unwrap();
        p.save_node(
            NodeId::canonical("a"),
            DagNode::direct(Node::feature("a", ObjectId::from_bytes(b"a"))),
        )
        .unwrap();
        p.dispose().unwrap();
        assert_eq!(p.trees_len().unwrap(), 0);
        assert_eq!(p.nodes_len().unwrap(), 0);
    }
}

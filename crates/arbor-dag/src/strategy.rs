//! Put/remove sessions over a clustered tree.
//!
//! A [`ClusteringStrategy`] mirrors an original [`RevTree`] into mutable
//! [`Dag`]s only along the paths that are touched. Inserts descend from the
//! root DAG, threading the depth; leaves that outgrow their size limit are
//! split into bucket DAGs one level deeper, and routing DAGs whose count
//! falls back under the limit are collapsed into a flat leaf again.
//!
//! DAGs in use are held in a write buffer keyed by [`TreeId`] and flushed to
//! the [`DagStorageProvider`] once the buffer reaches
//! [`DagConfig::buffered_dag_limit`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use arbor_store::{Node, NodeKind, RevTree};
use arbor_types::{Envelope, NodeId, ObjectId, TreeId};

use crate::clustering::{CanonicalClustering, Clustering, QuadTreeClustering};
use crate::config::DagConfig;
use crate::dag::{Dag, DagState};
use crate::error::{DagError, DagResult};
use crate::node::DagNode;
use crate::storage::DagStorageProvider;

/// Effect of routing one entry through a DAG.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct PutOutcome {
    /// Change in the number of entries under the DAG.
    delta: i64,
    /// Whether the DAG must be rebuilt.
    changed: bool,
    /// Entries under the DAG afterwards.
    remaining: u64,
}

pub struct ClusteringStrategy {
    clustering: Box<dyn Clustering>,
    provider: Arc<dyn DagStorageProvider>,
    root_id: TreeId,
    buffer: BTreeMap<TreeId, Dag>,
    config: DagConfig,
}

impl ClusteringStrategy {
    /// Start a session mirroring `original_tree_id`; a null id starts from
    /// the empty tree.
    pub fn new(
        original_tree_id: ObjectId,
        clustering: Box<dyn Clustering>,
        provider: Arc<dyn DagStorageProvider>,
        config: DagConfig,
    ) -> DagResult<Self> {
        config.validate()?;
        let root_id = TreeId::root();
        let root = provider.get_or_create_tree(&root_id, original_tree_id)?;
        debug!(
            clustering = clustering.name(),
            original = %root.original_tree_id().short_hex(),
            "started clustering session"
        );
        let mut buffer = BTreeMap::new();
        buffer.insert(root_id.clone(), root);
        Ok(Self {
            clustering,
            provider,
            root_id,
            buffer,
            config,
        })
    }

    pub fn canonical(
        original_tree_id: ObjectId,
        provider: Arc<dyn DagStorageProvider>,
        config: DagConfig,
    ) -> DagResult<Self> {
        Self::new(
            original_tree_id,
            Box::new(CanonicalClustering::new()),
            provider,
            config,
        )
    }

    pub fn quadtree(
        original_tree_id: ObjectId,
        max_bounds: Envelope,
        provider: Arc<dyn DagStorageProvider>,
        config: DagConfig,
    ) -> DagResult<Self> {
        Self::new(
            original_tree_id,
            Box::new(QuadTreeClustering::new(max_bounds)),
            provider,
            config,
        )
    }

    pub fn clustering(&self) -> &dyn Clustering {
        self.clustering.as_ref()
    }

    pub fn provider(&self) -> &Arc<dyn DagStorageProvider> {
        &self.provider
    }

    pub fn config(&self) -> &DagConfig {
        &self.config
    }

    /// Id of the DAG the next build starts from. Starts at the root and
    /// moves down when [`build_root`](Self::build_root) skips single-bucket
    /// levels.
    pub fn root_id(&self) -> &TreeId {
        &self.root_id
    }

    /// Id an entry is tracked under, or `None` if it is not indexed.
    pub fn compute_id(&self, node: &Node) -> Option<NodeId> {
        self.clustering.compute_id(node)
    }

    // ---------------------------------------------------------------
    // Mutation
    // ---------------------------------------------------------------

    /// Insert or replace an entry. A tombstone removes it instead.
    ///
    /// Returns the change in entry count: `1` for an insert, `-1` for a
    /// removal and `0` for a replaced value, a missing removal or an entry
    /// the clustering does not index.
    pub fn put(&mut self, node: Node) -> DagResult<i64> {
        let Some(id) = self.clustering.compute_id(&node) else {
            return Ok(0);
        };
        let removal = node.is_tombstone();
        if !removal {
            self.provider.save_node(id.clone(), DagNode::direct(node))?;
        }
        let outcome = self.put_at(&TreeId::root(), &id, removal)?;
        if self.buffer.len() >= self.config.buffered_dag_limit {
            self.flush()?;
        }
        Ok(outcome.delta)
    }

    /// Remove an entry by name; `true` if it was present.
    ///
    /// Only clusterings that can place an entry by its name alone honor
    /// this; spatial clustering needs [`remove_node`](Self::remove_node).
    pub fn remove(&mut self, name: &str) -> DagResult<bool> {
        Ok(self.put(Node::tombstone(name))? == -1)
    }

    /// Remove an entry, locating it by everything the clustering needs.
    pub fn remove_node(&mut self, node: &Node) -> DagResult<bool> {
        Ok(self.put(node.update(ObjectId::NULL))? == -1)
    }

    /// Replace `old` with `new`. Both must name the same entry.
    ///
    /// Nothing happens unless `old` is present; otherwise returns what
    /// [`put`](Self::put) returns for `new`.
    pub fn update(&mut self, old: &Node, new: Node) -> DagResult<i64> {
        if old.name != new.name {
            return Err(DagError::InvalidArgument(format!(
                "cannot update {} with {}",
                old.name, new.name
            )));
        }
        if !self.remove_node(old)? {
            return Ok(0);
        }
        self.put(new)
    }

    fn put_at(&mut self, id: &TreeId, node: &NodeId, removal: bool) -> DagResult<PutOutcome> {
        let mut dag = self.take(id)?;
        let outcome = self.put_into(&mut dag, node, removal);
        if let Ok(out) = &outcome {
            if out.remaining == 0 && !id.is_root() {
                dag.reset();
            }
        }
        self.buffer.insert(id.clone(), dag);
        outcome
    }

    fn put_into(&mut self, dag: &mut Dag, node: &NodeId, removal: bool) -> DagResult<PutOutcome> {
        if dag.state() == DagState::Initialized {
            self.mirror(dag)?;
        }
        let depth = dag.id().depth_length();
        let limit = self.clustering.normalized_size_limit(depth) as u64;

        let (delta, child_changed) = if dag.is_routing() {
            match self.clustering.bucket_path(node, depth) {
                None => (non_promotable(dag, node, removal), false),
                Some(child_id) => {
                    if dag.buckets().contains(&child_id) {
                        let out = self.put_at(&child_id, node, removal)?;
                        if out.remaining == 0 {
                            dag.remove_bucket(&child_id);
                        }
                        (out.delta, out.changed)
                    } else if removal {
                        (0, false)
                    } else {
                        let child = self.load_or_create(&child_id, ObjectId::NULL)?;
                        self.buffer.insert(child_id.clone(), child);
                        dag.add_bucket(child_id.clone());
                        let out = self.put_at(&child_id, node, removal)?;
                        (out.delta, out.changed)
                    }
                }
            }
        } else {
            let delta = if removal {
                -i64::from(dag.remove_child(node))
            } else {
                i64::from(dag.add_child(node.clone()))
            };
            if dag.num_children() as u64 > limit && depth < self.clustering.max_depth() {
                self.split(dag)?;
            }
            (delta, false)
        };

        if delta != 0 {
            let count = dag.child_count().saturating_add_signed(delta);
            dag.set_child_count(count);
            if dag.is_routing() && count <= limit {
                self.collapse(dag)?;
            }
        }
        // A put that hits an existing entry still replaces its value.
        let changed = delta != 0 || child_changed || !removal;
        if changed {
            dag.set_changed();
        }
        Ok(PutOutcome {
            delta,
            changed,
            remaining: dag.child_count(),
        })
    }

    /// Spread the children of an overfull leaf over bucket DAGs.
    fn split(&mut self, dag: &mut Dag) -> DagResult<()> {
        let depth = dag.id().depth_length();
        let mut groups: BTreeMap<TreeId, Vec<NodeId>> = BTreeMap::new();
        for id in dag.take_children() {
            match self.clustering.bucket_path(&id, depth) {
                Some(child_id) => groups.entry(child_id).or_default().push(id),
                None => {
                    dag.add_non_promotable(id);
                }
            }
        }
        let buckets = groups.len();
        for (child_id, ids) in groups {
            let mut child = self.load_or_create(&child_id, ObjectId::NULL)?;
            let mut filled = Ok(());
            for id in &ids {
                if let Err(err) = self.put_into(&mut child, id, false) {
                    filled = Err(err);
                    break;
                }
            }
            self.buffer.insert(child_id.clone(), child);
            filled?;
            dag.add_bucket(child_id);
        }
        debug!(
            tree = %dag.id(),
            buckets,
            non_promotable = dag.non_promotable().len(),
            "split DAG"
        );
        Ok(())
    }

    /// Pull every entry under a routing DAG back into its own children.
    fn collapse(&mut self, dag: &mut Dag) -> DagResult<()> {
        let mut gathered = BTreeSet::new();
        let mut visited = Vec::new();
        self.gather(dag, &mut gathered, &mut visited)?;

        let actual = gathered.len() as u64;
        if actual != dag.child_count() {
            return Err(DagError::CountMismatch {
                id: dag.id().clone(),
                expected: dag.child_count(),
                actual,
            });
        }

        for id in &visited {
            let mut child = self.take(id)?;
            child.reset();
            self.buffer.insert(id.clone(), child);
        }
        dag.take_buckets();
        dag.take_non_promotable();
        for id in gathered {
            dag.add_child(id);
        }
        debug!(tree = %dag.id(), entries = actual, "collapsed DAG");
        Ok(())
    }

    fn gather(
        &mut self,
        dag: &Dag,
        out: &mut BTreeSet<NodeId>,
        visited: &mut Vec<TreeId>,
    ) -> DagResult<()> {
        out.extend(dag.non_promotable().iter().cloned());
        out.extend(dag.children().iter().cloned());
        for bucket in dag.buckets() {
            let mut child = self.take(bucket)?;
            let mirrored = if child.state() == DagState::Initialized {
                self.mirror(&mut child)
            } else {
                Ok(())
            };
            let gathered = mirrored.and_then(|()| self.gather(&child, out, visited));
            self.buffer.insert(bucket.clone(), child);
            gathered?;
            visited.push(bucket.clone());
        }
        Ok(())
    }

    /// Copy the structure of the DAG's original tree into it.
    ///
    /// Entries of a leaf become lazy children. Direct entries of a bucketed
    /// tree become non-promotable, and each bucket gets an untouched child
    /// DAG mirroring its subtree.
    fn mirror(&mut self, dag: &mut Dag) -> DagResult<()> {
        let original = self.provider.get_tree(&dag.original_tree_id())?;
        let cache = Arc::clone(self.provider.tree_cache());
        let leaf = original.buckets().is_empty();

        let mut lazy = BTreeMap::new();
        let mut skipped = 0u64;
        if !original.trees().is_empty() || !original.features().is_empty() {
            let handle = cache.get_tree_id(&original)?;
            let entries = original
                .trees()
                .iter()
                .enumerate()
                .map(|(i, n)| (NodeKind::Tree, i, n))
                .chain(
                    original
                        .features()
                        .iter()
                        .enumerate()
                        .map(|(i, n)| (NodeKind::Feature, i, n)),
                );
            for (kind, index, node) in entries {
                let Some(id) = self.clustering.compute_id(node) else {
                    skipped += 1;
                    continue;
                };
                let index = u32::try_from(index).map_err(|_| {
                    DagError::InvalidArgument(format!("tree {} is too large", original.id()))
                })?;
                if leaf {
                    dag.add_child(id.clone());
                } else {
                    dag.add_non_promotable(id.clone());
                }
                lazy.insert(id, DagNode::lazy(kind, handle, index));
            }
        }

        if !leaf {
            let depth = dag.id().depth_length();
            let fan_out = self.clustering.max_buckets(depth);
            if let Some(index) = original.buckets().keys().find(|i| usize::from(**i) >= fan_out) {
                return Err(DagError::InvalidArgument(format!(
                    "tree {} has bucket {index} past the fan-out of {fan_out} at depth {depth}",
                    original.id()
                )));
            }
            cache.preload(original.buckets().values().map(|b| b.tree_id))?;
            for (index, bucket) in original.buckets() {
                let child_id = dag.id().new_child(*index);
                let child = self.load_or_create(&child_id, bucket.tree_id)?;
                self.buffer.insert(child_id.clone(), child);
                dag.add_bucket(child_id);
            }
        }

        self.provider.save_nodes(lazy)?;
        dag.set_child_count(original.entry_count().saturating_sub(skipped));
        dag.set_mirrored();
        debug!(tree = %dag.id(), leaf, entries = dag.child_count(), "mirrored DAG");
        Ok(())
    }

    // ---------------------------------------------------------------
    // Buffer
    // ---------------------------------------------------------------

    /// Remove an existing DAG from the buffer, or fetch it from the provider.
    fn take(&mut self, id: &TreeId) -> DagResult<Dag> {
        if let Some(dag) = self.buffer.remove(id) {
            return Ok(dag);
        }
        let ids = BTreeSet::from([id.clone()]);
        self.provider
            .get_trees(&ids)?
            .remove(id)
            .ok_or_else(|| DagError::MissingTrees {
                requested: 1,
                missing: vec![id.clone()],
            })
    }

    fn load_or_create(&mut self, id: &TreeId, original_tree_id: ObjectId) -> DagResult<Dag> {
        match self.buffer.remove(id) {
            Some(dag) => Ok(dag),
            None => self.provider.get_or_create_tree(id, original_tree_id),
        }
    }

    /// Copy of a DAG without taking it out of the buffer.
    fn peek(&self, id: &TreeId) -> DagResult<Dag> {
        if let Some(dag) = self.buffer.get(id) {
            return Ok(dag.clone());
        }
        let ids = BTreeSet::from([id.clone()]);
        self.provider
            .get_trees(&ids)?
            .remove(id)
            .ok_or_else(|| DagError::MissingTrees {
                requested: 1,
                missing: vec![id.clone()],
            })
    }

    /// Hand every buffered DAG to the provider.
    pub fn flush(&mut self) -> DagResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let dags = std::mem::take(&mut self.buffer);
        let count = dags.len();
        self.provider.save(dags)?;
        debug!(count, "flushed DAG buffer");
        Ok(())
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    /// Skip single-bucket root levels, flush, and return the DAG to build.
    pub fn build_root(&mut self) -> DagResult<Dag> {
        let mut id = TreeId::root();
        loop {
            let dag = self.peek(&id)?;
            let next = match dag.buckets().first() {
                Some(only) if dag.num_buckets() == 1 && dag.non_promotable().is_empty() => {
                    only.clone()
                }
                _ => break,
            };
            id = next;
        }
        if id != self.root_id {
            debug!(root = %id, "moved build root");
        }
        self.root_id = id;
        self.flush()?;
        self.peek(&self.root_id.clone())
    }

    /// Flush, then fetch the given DAGs from the provider.
    pub fn get_dag_trees(&mut self, ids: &BTreeSet<TreeId>) -> DagResult<BTreeMap<TreeId, Dag>> {
        self.flush()?;
        self.provider.get_trees(ids)
    }

    pub fn get_node(&self, id: &NodeId) -> DagResult<Option<Node>> {
        self.provider
            .get_node(id)?
            .map(|node| node.resolve(self.provider.tree_cache()))
            .transpose()
    }

    pub fn get_nodes(&self, ids: &BTreeSet<NodeId>) -> DagResult<BTreeMap<NodeId, Node>> {
        self.provider.resolve_nodes(ids)
    }

    /// Levels of buckets below the root; a flat tree has depth 0.
    pub fn depth(&self) -> DagResult<usize> {
        self.dag_depth(&TreeId::root())
    }

    fn dag_depth(&self, id: &TreeId) -> DagResult<usize> {
        let dag = self.peek(id)?;
        if dag.state() == DagState::Initialized {
            return self.tree_depth(&dag.original_tree_id());
        }
        let mut deepest = None;
        for bucket in dag.buckets() {
            let depth = self.dag_depth(bucket)?;
            deepest = Some(deepest.map_or(depth, |d: usize| d.max(depth)));
        }
        Ok(deepest.map_or(0, |d| d + 1))
    }

    fn tree_depth(&self, id: &ObjectId) -> DagResult<usize> {
        let tree = self.provider.get_tree(id)?;
        let mut deepest = None;
        for bucket in tree.buckets().values() {
            let depth = self.tree_depth(&bucket.tree_id)?;
            deepest = Some(deepest.map_or(depth, |d: usize| d.max(depth)));
        }
        Ok(deepest.map_or(0, |d| d + 1))
    }

    /// Call `f` with the id of every live entry.
    pub fn visit<F>(&self, mut f: F) -> DagResult<()>
    where
        F: FnMut(&NodeId),
    {
        self.visit_dag(&TreeId::root(), &mut f)
    }

    fn visit_dag(&self, id: &TreeId, f: &mut dyn FnMut(&NodeId)) -> DagResult<()> {
        let dag = self.peek(id)?;
        if dag.state() == DagState::Initialized {
            let tree = self.provider.get_tree(&dag.original_tree_id())?;
            return self.visit_tree(&tree, f);
        }
        for id in dag.non_promotable().iter().chain(dag.children()) {
            f(id);
        }
        for bucket in dag.buckets() {
            self.visit_dag(bucket, f)?;
        }
        Ok(())
    }

    fn visit_tree(&self, tree: &RevTree, f: &mut dyn FnMut(&NodeId)) -> DagResult<()> {
        for node in tree.trees().iter().chain(tree.features()) {
            if let Some(id) = self.clustering.compute_id(node) {
                f(&id);
            }
        }
        for bucket in tree.buckets().values() {
            let subtree = self.provider.get_tree(&bucket.tree_id)?;
            self.visit_tree(&subtree, f)?;
        }
        Ok(())
    }

    /// Drop the buffer and release the provider.
    pub fn dispose(&mut self) -> DagResult<()> {
        self.buffer.clear();
        self.provider.dispose()
    }
}

/// Apply an entry to the non-promotable set; returns the count delta.
fn non_promotable(dag: &mut Dag, node: &NodeId, removal: bool) -> i64 {
    if removal {
        -i64::from(dag.remove_non_promotable(node))
    } else {
        i64::from(dag.add_non_promotable(node.clone()))
    }
}

impl std::fmt::Debug for ClusteringStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusteringStrategy")
            .field("clustering", &self.clustering.name())
            .field("root_id", &self.root_id)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

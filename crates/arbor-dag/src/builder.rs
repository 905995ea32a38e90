//! Parallel rebuild of immutable trees from DAGs.
//!
//! Every changed DAG is rebuilt bottom-up: leaves from their resolved
//! entries, routing DAGs from the trees of their buckets, which are built
//! concurrently on a shared `rayon` pool. Untouched DAGs reuse their original
//! tree as is. New trees are batched and written to the target store.
//!
//! Cancellation is cooperative. A caller-supplied predicate and an internal
//! abort flag are checked before and after every store access; a cancelled
//! build returns `Ok(None)`. A failing task sets the abort flag so siblings
//! stop early, and its error is returned once all tasks have finished.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use parking_lot::RwLock;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use arbor_store::{NodeKind, ObjectStore, RevTree, RevTreeBuilder};
use arbor_types::{NodeId, ObjectId, TreeId};

use crate::config::DagConfig;
use crate::dag::{Dag, DagState};
use crate::error::{DagError, DagResult};
use crate::storage::DagStorageProvider;
use crate::strategy::ClusteringStrategy;

static POOL: OnceLock<ThreadPool> = OnceLock::new();

/// Process-wide worker pool, sized to the available parallelism.
fn pool() -> DagResult<&'static ThreadPool> {
    if let Some(pool) = POOL.get() {
        return Ok(pool);
    }
    let threads = thread::available_parallelism()
        .map_or(2, |n| n.get())
        .max(2);
    let pool = ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("dag-tree-builder-{i}"))
        .build()
        .map_err(|e| DagError::ThreadPool(format!("rayon pool: {e}")))?;
    Ok(POOL.get_or_init(|| pool))
}

type CancelFn<'a> = dyn Fn() -> bool + Send + Sync + 'a;

pub struct DagTreeBuilder<'a> {
    target: &'a dyn ObjectStore,
    flush_threshold: usize,
    cancel: Option<Box<CancelFn<'a>>>,
}

impl<'a> DagTreeBuilder<'a> {
    pub const DEFAULT_FLUSH_THRESHOLD: usize = 1_000;

    pub fn new(target: &'a dyn ObjectStore) -> Self {
        Self {
            target,
            flush_threshold: Self::DEFAULT_FLUSH_THRESHOLD,
            cancel: None,
        }
    }

    /// Builder using the batch size from `config`.
    pub fn with_config(target: &'a dyn ObjectStore, config: &DagConfig) -> Self {
        Self::new(target).with_flush_threshold(config.builder_flush_threshold)
    }

    /// New trees batched before each write to the target store.
    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold.max(1);
        self
    }

    /// Stop the build as soon as `cancel` returns true.
    pub fn with_cancel<F>(mut self, cancel: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'a,
    {
        self.cancel = Some(Box::new(cancel));
        self
    }

    /// Build the session's tree. Returns `None` if the build was cancelled.
    pub fn build(&self, strategy: &mut ClusteringStrategy) -> DagResult<Option<RevTree>> {
        let root = strategy.build_root()?;
        let root_id = strategy.root_id().clone();
        let state = BuildState {
            provider: strategy.provider().as_ref(),
            target: self.target,
            new_trees: RwLock::new(HashMap::new()),
            flush_threshold: self.flush_threshold,
            aborted: AtomicBool::new(false),
            cancel: self.cancel.as_deref(),
            written: AtomicUsize::new(0),
        };

        let built = pool()?.install(|| state.build_dag(&root));
        let Some(mut tree) = built? else {
            debug!("tree build cancelled");
            return Ok(None);
        };
        if state.cancelled() {
            debug!("tree build cancelled");
            return Ok(None);
        }

        // The build root may sit below the real root; wrap it back up.
        for index in root_id.as_bytes().iter().rev() {
            if tree.is_empty() {
                break;
            }
            let parent = RevTreeBuilder::new().bucket(*index, &tree).build();
            tree = state.register(parent)?;
        }
        state.flush()?;

        info!(
            tree = %tree.id().short_hex(),
            size = tree.size(),
            written = state.written.load(Ordering::Relaxed),
            "built tree"
        );
        Ok(Some(Arc::try_unwrap(tree).unwrap_or_else(|shared| (*shared).clone())))
    }
}

impl std::fmt::Debug for DagTreeBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagTreeBuilder")
            .field("flush_threshold", &self.flush_threshold)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// State shared by every task of one build.
struct BuildState<'s> {
    provider: &'s dyn DagStorageProvider,
    target: &'s dyn ObjectStore,
    new_trees: RwLock<HashMap<ObjectId, Arc<RevTree>>>,
    flush_threshold: usize,
    aborted: AtomicBool,
    cancel: Option<&'s CancelFn<'s>>,
    written: AtomicUsize,
}

impl BuildState<'_> {
    fn cancelled(&self) -> bool {
        self.aborted.load(Ordering::Acquire) || self.cancel.is_some_and(|cancel| cancel())
    }

    fn build_dag(&self, dag: &Dag) -> DagResult<Option<Arc<RevTree>>> {
        let result = self.build_dag_inner(dag);
        if result.is_err() {
            self.aborted.store(true, Ordering::Release);
        }
        result
    }

    fn build_dag_inner(&self, dag: &Dag) -> DagResult<Option<Arc<RevTree>>> {
        if self.cancelled() {
            return Ok(None);
        }
        let tree = match dag.state() {
            DagState::Changed if dag.buckets().is_empty() => {
                let ids: BTreeSet<NodeId> = dag
                    .children()
                    .iter()
                    .chain(dag.non_promotable())
                    .cloned()
                    .collect();
                let Some(builder) = self.add_entries(RevTreeBuilder::new(), &ids)? else {
                    return Ok(None);
                };
                self.register(builder.build())?
            }
            DagState::Changed => match self.build_buckets(dag)? {
                Some(tree) => self.register(tree)?,
                None => return Ok(None),
            },
            DagState::Initialized | DagState::Mirrored => {
                self.existing(&dag.original_tree_id())?
            }
        };
        if self.cancelled() {
            return Ok(None);
        }
        Ok(Some(tree))
    }

    fn build_buckets(&self, dag: &Dag) -> DagResult<Option<RevTree>> {
        let children = self.provider.get_trees(dag.buckets())?;
        if self.cancelled() {
            return Ok(None);
        }

        let results: Vec<(&TreeId, DagResult<Option<Arc<RevTree>>>)> = children
            .par_iter()
            .map(|(id, child)| (id, self.build_dag(child)))
            .collect();

        let mut built = BTreeMap::new();
        let mut cancelled = false;
        for (id, result) in results {
            match result? {
                Some(tree) => {
                    let index = id.leaf_bucket().ok_or_else(|| {
                        DagError::InvalidArgument(format!("bucket DAG {id} has no bucket index"))
                    })?;
                    built.insert(index, tree);
                }
                None => cancelled = true,
            }
        }
        if cancelled {
            return Ok(None);
        }

        let Some(mut builder) = self.add_entries(RevTreeBuilder::new(), dag.non_promotable())?
        else {
            return Ok(None);
        };
        for (index, tree) in &built {
            builder = builder.bucket(*index, tree);
        }
        Ok(Some(builder.build()))
    }

    /// Resolve `ids` and add them as direct entries.
    fn add_entries(
        &self,
        mut builder: RevTreeBuilder,
        ids: &BTreeSet<NodeId>,
    ) -> DagResult<Option<RevTreeBuilder>> {
        if ids.is_empty() {
            return Ok(Some(builder));
        }
        let nodes = self.provider.resolve_nodes(ids)?;
        if self.cancelled() {
            return Ok(None);
        }
        if let Some(missing) = ids.iter().find(|id| !nodes.contains_key(*id)) {
            return Err(DagError::NodeNotFound(missing.name().to_string()));
        }
        for node in nodes.into_values() {
            if node.is_tombstone() {
                continue;
            }
            builder = match node.kind {
                NodeKind::Tree => {
                    let size = self.existing(&node.object_id)?.size();
                    builder.tree(node, size)
                }
                NodeKind::Feature => builder.feature(node),
            };
        }
        Ok(Some(builder))
    }

    /// A tree that already exists, from this build or the source store.
    fn existing(&self, id: &ObjectId) -> DagResult<Arc<RevTree>> {
        if let Some(tree) = self.new_trees.read().get(id) {
            return Ok(Arc::clone(tree));
        }
        self.provider.get_tree(id)
    }

    /// Record a newly built tree, writing the batch once it is full.
    fn register(&self, tree: RevTree) -> DagResult<Arc<RevTree>> {
        let tree = Arc::new(tree);
        if tree.is_empty() {
            return Ok(tree);
        }
        let mut new_trees = self.new_trees.write();
        new_trees.insert(tree.id(), Arc::clone(&tree));
        if new_trees.len() >= self.flush_threshold {
            self.write(&mut new_trees)?;
        }
        Ok(tree)
    }

    fn flush(&self) -> DagResult<()> {
        let mut new_trees = self.new_trees.write();
        self.write(&mut new_trees)
    }

    fn write(&self, new_trees: &mut HashMap<ObjectId, Arc<RevTree>>) -> DagResult<()> {
        if new_trees.is_empty() {
            return Ok(());
        }
        let batch: Vec<RevTree> = new_trees
            .drain()
            .map(|(_, tree)| Arc::try_unwrap(tree).unwrap_or_else(|shared| (*shared).clone()))
            .collect();
        self.target.write_trees(&batch)?;
        self.written.fetch_add(batch.len(), Ordering::Relaxed);
        debug!(count = batch.len(), "wrote tree batch");
        Ok(())
    }
}

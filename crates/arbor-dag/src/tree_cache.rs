//! Interning table for original trees referenced by lazy entries.
//!
//! Mirroring a leaf of the original tree records each entry as a
//! `(handle, index)` pair instead of copying it. The handle is a small
//! integer issued here; resolving it reloads the tree from the object store
//! if it has been evicted.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sieve_cache::SieveCache;
use tracing::debug;

use arbor_store::{ObjectStore, RevTree};
use arbor_types::ObjectId;

use crate::config::DagConfig;
use crate::error::{DagError, DagResult};

#[derive(Default)]
struct Handles {
    ids: Vec<ObjectId>,
    by_id: HashMap<ObjectId, u32>,
}

/// Handle table plus a bounded cache of loaded original trees.
pub struct TreeCache {
    store: Arc<dyn ObjectStore>,
    handles: RwLock<Handles>,
    trees: Mutex<SieveCache<ObjectId, Arc<RevTree>>>,
    empty: Arc<RevTree>,
}

impl TreeCache {
    pub fn new(store: Arc<dyn ObjectStore>, capacity: usize) -> DagResult<Self> {
        let trees = SieveCache::new(capacity)
            .map_err(|e| DagError::Config(format!("tree cache capacity: {e}")))?;
        Ok(Self {
            store,
            handles: RwLock::new(Handles::default()),
            trees: Mutex::new(trees),
            empty: Arc::new(RevTree::empty()),
        })
    }

    /// Cache holding up to [`DagConfig::tree_cache_capacity`] trees.
    pub fn from_config(store: Arc<dyn ObjectStore>, config: &DagConfig) -> DagResult<Self> {
        Self::new(store, config.tree_cache_capacity)
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Handle for `tree`, issuing a new one on first sight.
    pub fn get_tree_id(&self, tree: &Arc<RevTree>) -> DagResult<u32> {
        let id = tree.id();
        if let Some(handle) = self.handles.read().by_id.get(&id) {
            return Ok(*handle);
        }
        let handle = {
            let mut handles = self.handles.write();
            match handles.by_id.get(&id) {
                Some(handle) => *handle,
                None => {
                    let handle = u32::try_from(handles.ids.len()).map_err(|_| {
                        DagError::InvalidArgument("tree cache handles exhausted".into())
                    })?;
                    handles.ids.push(id);
                    handles.by_id.insert(id, handle);
                    handle
                }
            }
        };
        self.trees.lock().insert(id, Arc::clone(tree));
        Ok(handle)
    }

    /// The tree a handle was issued for.
    pub fn resolve(&self, handle: u32) -> DagResult<Arc<RevTree>> {
        let id = self
            .handles
            .read()
            .ids
            .get(handle as usize)
            .copied()
            .ok_or(DagError::InvalidTreeHandle(handle))?;
        self.tree(&id)
    }

    /// Load a tree through the cache.
    pub fn tree(&self, id: &ObjectId) -> DagResult<Arc<RevTree>> {
        if *id == RevTree::empty_id() || id.is_null() {
            return Ok(Arc::clone(&self.empty));
        }
        if let Some(tree) = self.trees.lock().get(id) {
            return Ok(Arc::clone(tree));
        }
        let tree = Arc::new(self.store.get_tree(id)?);
        self.trees.lock().insert(*id, Arc::clone(&tree));
        Ok(tree)
    }

    /// Warm the cache with the given trees. Returns how many were loaded.
    pub fn preload<I>(&self, ids: I) -> DagResult<usize>
    where
        I: IntoIterator<Item = ObjectId>,
    {
        let mut loaded = 0;
        for id in ids {
            let cached = self.trees.lock().get(&id).is_some();
            if !cached {
                self.tree(&id)?;
                loaded += 1;
            }
        }
        if loaded > 0 {
            debug!(loaded, "preloaded trees");
        }
        Ok(loaded)
    }

    /// Number of handles issued so far.
    pub fn len(&self) -> usize {
        self.handles.read().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of trees currently resident.
    pub fn resident(&self) -> usize {
        self.trees.lock().len()
    }
}

impl std::fmt::Debug for TreeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeCache")
            .field("handles", &self.len())
            .field("resident", &self.resident())
            .finish()
    }
}

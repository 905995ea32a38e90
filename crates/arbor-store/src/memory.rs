use std::collections::HashMap;
use std::sync::RwLock;

use arbor_types::ObjectId;

use crate::error::StoreResult;
use crate::object::RevTree;
use crate::traits::ObjectStore;

/// In-memory, HashMap-based tree store.
///
/// Intended for tests and embedding. Trees are cloned on read and write.
pub struct InMemoryObjectStore {
    trees: RwLock<HashMap<ObjectId, RevTree>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            trees: RwLock::new(HashMap::new()),
        }
    }

    /// Number of trees currently stored.
    pub fn len(&self) -> usize {
        self.trees.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.read().expect("lock poisoned").is_empty()
    }

    /// Sorted list of all stored tree ids.
    pub fn all_ids(&self) -> Vec<ObjectId> {
        let map = self.trees.read().expect("lock poisoned");
        let mut ids: Vec<ObjectId> = map.keys().copied().collect();
        ids.sort();
        ids
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn read_tree(&self, id: &ObjectId) -> StoreResult<Option<RevTree>> {
        let map = self.trees.read().expect("lock poisoned");
        Ok(map.get(id).cloned())
    }

    fn write_tree(&self, tree: &RevTree) -> StoreResult<ObjectId> {
        let id = tree.id();
        if id == RevTree::empty_id() {
            return Ok(id);
        }
        let mut map = self.trees.write().expect("lock poisoned");
        map.entry(id).or_insert_with(|| tree.clone());
        Ok(id)
    }

    fn exists(&self, id: &ObjectId) -> StoreResult<bool> {
        if *id == RevTree::empty_id() {
            return Ok(true);
        }
        let map = self.trees.read().expect("lock poisoned");
        Ok(map.contains_key(id))
    }

    fn write_trees(&self, trees: &[RevTree]) -> StoreResult<Vec<ObjectId>> {
        let empty = RevTree::empty_id();
        let mut map = self.trees.write().expect("lock poisoned");
        Ok(trees
            .iter()
            .map(|tree| {
                if tree.id() != empty {
                    map.entry(tree.id()).or_insert_with(|| tree.clone());
                }
                tree.id()
            })
            .collect())
    }
}

impl std::fmt::Debug for InMemoryObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryObjectStore")
            .field("tree_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::object::{Node, RevTreeBuilder};

    fn leaf(names: &[&str]) -> RevTree {
        names
            .iter()
            .fold(RevTreeBuilder::new(), |b, n| {
                b.feature(Node::feature(*n, ObjectId::from_bytes(n.as_bytes())))
            })
            .build()
    }

    #[test]
    fn write_then_read() {
        let store = InMemoryObjectStore::new();
        let tree = leaf(&["a", "b"]);
        let id = store.write_tree(&tree).unwrap();
        assert_eq!(id, tree.id());
        assert_eq!(store.read_tree(&id).unwrap(), Some(tree.clone()));
        assert_eq!(store.get_tree(&id).unwrap(), tree);
        assert!(store.exists(&id).unwrap());
    }

    #[test]
    fn writes_are_idempotent() {
        let store = InMemoryObjectStore::new();
        let tree = leaf(&["a"]);
        store.write_tree(&tree).unwrap();
        store.write_tree(&tree).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn empty_tree_is_implicit() {
        let store = InMemoryObjectStore::new();
        assert!(store.exists(&RevTree::empty_id()).unwrap());
        assert!(store.get_tree(&RevTree::empty_id()).unwrap().is_empty());
        store.write_tree(&RevTree::empty()).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn missing_tree_is_not_found() {
        let store = InMemoryObjectStore::new();
        let id = ObjectId::from_bytes(b"nope");
        assert_eq!(store.read_tree(&id).unwrap(), None);
        assert!(matches!(store.get_tree(&id), Err(StoreError::NotFound(x)) if x == id));
    }

    #[test]
    fn batch_write() {
        let store = InMemoryObjectStore::new();
        let trees = vec![leaf(&["a"]), leaf(&["b"]), RevTree::empty()];
        let ids = store.write_trees(&trees).unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(store.len(), 2);
        assert_eq!(store.all_ids().len(), 2);
    }
}

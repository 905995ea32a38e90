use arbor_types::ObjectId;

use crate::error::{StoreError, StoreResult};
use crate::object::RevTree;

/// Content-addressed store of immutable trees.
///
/// All implementations must satisfy these invariants:
/// - Trees are immutable once written; writing an existing id is a no-op.
/// - The empty tree is implicitly present and never needs to be written.
/// - Concurrent reads are always safe.
/// - All I/O errors are propagated, never silently ignored.
pub trait ObjectStore: Send + Sync {
    /// Read a tree by id. Returns `Ok(None)` if it does not exist.
    fn read_tree(&self, id: &ObjectId) -> StoreResult<Option<RevTree>>;

    /// Write a tree and return its id.
    fn write_tree(&self, tree: &RevTree) -> StoreResult<ObjectId>;

    fn exists(&self, id: &ObjectId) -> StoreResult<bool>;

    /// Read a tree that must exist.
    fn get_tree(&self, id: &ObjectId) -> StoreResult<RevTree> {
        if *id == RevTree::empty_id() {
            return Ok(RevTree::empty());
        }
        self.read_tree(id)?.ok_or(StoreError::NotFound(*id))
    }

    /// Write multiple trees in a batch and return their ids.
    ///
    /// Default implementation calls `write_tree()` for each tree. Backends
    /// may override to batch I/O.
    fn write_trees(&self, trees: &[RevTree]) -> StoreResult<Vec<ObjectId>> {
        trees.iter().map(|t| self.write_tree(t)).collect()
    }
}

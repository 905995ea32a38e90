use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a DAG inside the clustered tree.
///
/// Each byte is the bucket index chosen at one depth level, so the root is
/// the empty path and `[3, 1]` is bucket 1 of bucket 3 of the root. Ordering
/// is lexicographic over the path bytes.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TreeId(Vec<u8>);

impl TreeId {
    /// The root path.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new(path: Vec<u8>) -> Self {
        Self(path)
    }

    pub fn from_slice(path: &[u8]) -> Self {
        Self(path.to_vec())
    }

    /// Number of bucket levels below the root.
    pub fn depth_length(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Bucket index at `depth`, if the path is that deep.
    pub fn bucket_index(&self, depth: usize) -> Option<u8> {
        self.0.get(depth).copied()
    }

    /// Bucket index at the deepest level.
    pub fn leaf_bucket(&self) -> Option<u8> {
        self.0.last().copied()
    }

    /// Path of the child bucket `bucket` under this one.
    pub fn new_child(&self, bucket: u8) -> TreeId {
        let mut path = Vec::with_capacity(self.0.len() + 1);
        path.extend_from_slice(&self.0);
        path.push(bucket);
        TreeId(path)
    }

    pub fn parent(&self) -> Option<TreeId> {
        match self.0.split_last() {
            Some((_, rest)) => Some(TreeId(rest.to_vec())),
            None => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Debug for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeId{:?}", self.0)
    }
}

impl From<Vec<u8>> for TreeId {
    fn from(path: Vec<u8>) -> Self {
        Self(path)
    }
}

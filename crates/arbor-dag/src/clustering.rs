//! Bucket addressing schemes.
//!
//! A [`Clustering`] decides which [`NodeId`] an entry is tracked under and
//! how large a DAG may grow at each depth before it is split.

use std::fmt;

use arbor_store::{Node, NodeKind};
use arbor_types::{Envelope, NodeId, Quadrant, TreeId, CANONICAL_MAX_DEPTH};

/// Addressing rules shared by a [`ClusteringStrategy`](crate::ClusteringStrategy).
pub trait Clustering: Send + Sync + fmt::Debug {
    /// Id the entry is tracked under, or `None` when this clustering does
    /// not index it at all.
    fn compute_id(&self, node: &Node) -> Option<NodeId>;

    /// Entries a leaf DAG at `depth` may hold before it is split.
    fn normalized_size_limit(&self, depth: usize) -> usize;

    /// Fan-out of a routing DAG at `depth`.
    fn max_buckets(&self, depth: usize) -> usize;

    /// Depth past which leaves are never split.
    fn max_depth(&self) -> usize;

    fn name(&self) -> &'static str;

    /// Bucket path of `id` down to and including `depth`, or `None` when
    /// the id cannot be promoted that far or falls outside the fan-out of
    /// some level.
    fn bucket_path(&self, id: &NodeId, depth: usize) -> Option<TreeId> {
        let mut path = Vec::with_capacity(depth + 1);
        for level in 0..=depth {
            let bucket = id
                .bucket(level)
                .filter(|bucket| usize::from(*bucket) < self.max_buckets(level))?;
            path.push(bucket);
        }
        Some(TreeId::new(path))
    }
}

/// Hash-ordered clustering keyed on the FNV-1a hash of the entry name.
#[derive(Clone, Copy, Debug, Default)]
pub struct CanonicalClustering;

impl CanonicalClustering {
    pub const MAX_BUCKETS: usize = 8;
    const ROOT_SIZE_LIMIT: usize = 512;
    const DEEP_SIZE_LIMIT: usize = 256;

    pub fn new() -> Self {
        Self
    }
}

impl Clustering for CanonicalClustering {
    fn compute_id(&self, node: &Node) -> Option<NodeId> {
        Some(NodeId::canonical(node.name.as_str()))
    }

    fn normalized_size_limit(&self, depth: usize) -> usize {
        if depth < 3 {
            Self::ROOT_SIZE_LIMIT
        } else {
            Self::DEEP_SIZE_LIMIT
        }
    }

    fn max_buckets(&self, _depth: usize) -> usize {
        Self::MAX_BUCKETS
    }

    fn max_depth(&self) -> usize {
        CANONICAL_MAX_DEPTH
    }

    fn name(&self) -> &'static str {
        "canonical"
    }
}

/// Spatial clustering: entries descend into the quadrant that fully
/// contains their bounds.
///
/// Entries without bounds, and tree entries, are not indexed. Entries whose
/// bounds straddle a quadrant boundary stop at that level and stay
/// non-promotable there.
#[derive(Clone, Copy, Debug)]
pub struct QuadTreeClustering {
    max_bounds: Envelope,
    max_depth: usize,
}

impl QuadTreeClustering {
    pub const DEFAULT_MAX_DEPTH: usize = 12;
    pub const SIZE_LIMIT: usize = 128;
    pub const MAX_BUCKETS: usize = 4;

    pub fn new(max_bounds: Envelope) -> Self {
        Self::with_max_depth(max_bounds, Self::DEFAULT_MAX_DEPTH)
    }

    pub fn with_max_depth(max_bounds: Envelope, max_depth: usize) -> Self {
        Self {
            max_bounds,
            max_depth,
        }
    }

    pub fn max_bounds(&self) -> &Envelope {
        &self.max_bounds
    }
}

impl Clustering for QuadTreeClustering {
    fn compute_id(&self, node: &Node) -> Option<NodeId> {
        if node.kind == NodeKind::Tree {
            return None;
        }
        let bounds = node.bounds?;
        let path = Quadrant::path_to(&self.max_bounds, &bounds, self.max_depth);
        Some(NodeId::quadrant(node.name.as_str(), path))
    }

    fn normalized_size_limit(&self, _depth: usize) -> usize {
        Self::SIZE_LIMIT
    }

    fn max_buckets(&self, _depth: usize) -> usize {
        Self::MAX_BUCKETS
    }

    fn max_depth(&self) -> usize {
        self.max_depth
    }

    fn name(&self) -> &'static str {
        "quadtree"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::ObjectId;

    fn feature(name: &str) -> Node {
        Node::feature(name, ObjectId::from_bytes(name.as_bytes()))
    }

    #[test]
    fn canonical_limits_shrink_with_depth() {
        let c = CanonicalClustering::new();
        assert_eq!(c.normalized_size_limit(0), 512);
        assert_eq!(c.normalized_size_limit(2), 512);
        assert_eq!(c.normalized_size_limit(3), 256);
        assert_eq!(c.max_buckets(7), 8);
        assert_eq!(c.max_depth(), 21);
    }

    #[test]
    fn canonical_bucket_path_follows_hash() {
        let c = CanonicalClustering::new();
        let id = c.compute_id(&feature("road.1")).unwrap();
        let path = c.bucket_path(&id, 2).unwrap();
        assert_eq!(path.depth_length(), 3);
        for level in 0..3 {
            assert_eq!(path.bucket_index(level), id.bucket(level));
        }
        assert!(c.bucket_path(&id, CANONICAL_MAX_DEPTH).is_none());
    }

    #[derive(Debug)]
    struct Binary;

    impl Clustering for Binary {
        fn compute_id(&self, node: &Node) -> Option<NodeId> {
            Some(NodeId::canonical(node.name.as_str()))
        }

        fn normalized_size_limit(&self, _depth: usize) -> usize {
            4
        }

        fn max_buckets(&self, _depth: usize) -> usize {
            2
        }

        fn max_depth(&self) -> usize {
            8
        }

        fn name(&self) -> &'static str {
            "binary"
        }
    }

    #[test]
    fn buckets_past_the_fan_out_are_not_promotable() {
        let b = Binary;
        let mut seen = [false; 2];
        for i in 0..64 {
            let id = b.compute_id(&feature(&format!("n{i}"))).unwrap();
            match b.bucket_path(&id, 0) {
                Some(path) => seen[usize::from(path.leaf_bucket().unwrap())] = true,
                None => assert!(id.bucket(0).unwrap() >= 2),
            }
        }
        assert_eq!(seen, [true, true]);
    }

    #[test]
    fn quadtree_skips_unbounded_and_tree_entries() {
        let q = QuadTreeClustering::new(Envelope::world());
        assert!(q.compute_id(&feature("plain")).is_none());
        let tree = Node::tree("sub", ObjectId::from_bytes(b"t")).with_bounds(Envelope::point(1.0, 1.0));
        assert!(q.compute_id(&tree).is_none());
    }

    #[test]
    fn quadtree_point_descends_to_max_depth() {
        let q = QuadTreeClustering::with_max_depth(Envelope::world(), 5);
        let node = feature("pt").with_bounds(Envelope::point(10.0, 10.0));
        let id = q.compute_id(&node).unwrap();
        assert_eq!(id.quadrants().len(), 5);
        assert_eq!(id.quadrants()[0], Quadrant::NorthEast);
        assert!(q.bucket_path(&id, 4).is_some());
        assert!(q.bucket_path(&id, 5).is_none());
    }

    #[test]
    fn straddling_bounds_are_not_promotable() {
        let q = QuadTreeClustering::new(Envelope::world());
        let node = feature("wide").with_bounds(Envelope::new(-10.0, -10.0, 10.0, 10.0));
        let id = q.compute_id(&node).unwrap();
        assert!(id.quadrants().is_empty());
        assert!(q.bucket_path(&id, 0).is_none());
    }
}

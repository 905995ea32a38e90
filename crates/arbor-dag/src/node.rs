//! Entry values held by the overlay.

use arbor_store::{Node, NodeKind};
use arbor_types::codec::{read_u8, read_varint, write_varint};

use crate::error::{DagError, DagResult};
use crate::tree_cache::TreeCache;

const MAGIC_DIRECT: u8 = 0x01;
const MAGIC_LAZY_TREE: u8 = 0x02;
const MAGIC_LAZY_FEATURE: u8 = 0x03;

/// Value of one entry in the overlay.
///
/// Entries copied from an original leaf tree stay lazy: they point at the
/// tree through a [`TreeCache`] handle and an index into its tree or
/// feature list. Entries written during the session are stored directly.
#[derive(Clone, Debug, PartialEq)]
pub enum DagNode {
    Direct(Node),
    LazyTree { handle: u32, index: u32 },
    LazyFeature { handle: u32, index: u32 },
}

impl DagNode {
    pub fn direct(node: Node) -> Self {
        DagNode::Direct(node)
    }

    pub fn lazy(kind: NodeKind, handle: u32, index: u32) -> Self {
        match kind {
            NodeKind::Tree => DagNode::LazyTree { handle, index },
            NodeKind::Feature => DagNode::LazyFeature { handle, index },
        }
    }

    /// Only direct entries can be tombstones.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, DagNode::Direct(node) if node.is_tombstone())
    }

    /// Materialize the entry, loading its original tree if needed.
    pub fn resolve(&self, cache: &TreeCache) -> DagResult<Node> {
        let (handle, index, kind) = match self {
            DagNode::Direct(node) => return Ok(node.clone()),
            DagNode::LazyTree { handle, index } => (*handle, *index, NodeKind::Tree),
            DagNode::LazyFeature { handle, index } => (*handle, *index, NodeKind::Feature),
        };
        let tree = cache.resolve(handle)?;
        let entries = match kind {
            NodeKind::Tree => tree.trees(),
            NodeKind::Feature => tree.features(),
        };
        entries
            .get(index as usize)
            .cloned()
            .ok_or(DagError::IndexOutOfBounds {
                handle,
                index,
                len: entries.len(),
            })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            DagNode::Direct(node) => {
                buf.push(MAGIC_DIRECT);
                node.write_to(buf);
            }
            DagNode::LazyTree { handle, index } => {
                buf.push(MAGIC_LAZY_TREE);
                write_varint(buf, *handle as u64);
                write_varint(buf, *index as u64);
            }
            DagNode::LazyFeature { handle, index } => {
                buf.push(MAGIC_LAZY_FEATURE);
                write_varint(buf, *handle as u64);
                write_varint(buf, *index as u64);
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf);
        buf
    }

    pub fn read_from(input: &mut &[u8]) -> DagResult<DagNode> {
        match read_u8(input)? {
            MAGIC_DIRECT => Ok(DagNode::Direct(Node::read_from(input)?)),
            magic @ (MAGIC_LAZY_TREE | MAGIC_LAZY_FEATURE) => {
                let handle = read_u32(input)?;
                let index = read_u32(input)?;
                Ok(if magic == MAGIC_LAZY_TREE {
                    DagNode::LazyTree { handle, index }
                } else {
                    DagNode::LazyFeature { handle, index }
                })
            }
            other => Err(DagError::InvalidMagic(other)),
        }
    }

    pub fn from_bytes(mut data: &[u8]) -> DagResult<DagNode> {
        Self::read_from(&mut data)
    }
}

fn read_u32(input: &mut &[u8]) -> DagResult<u32> {
    let value = read_varint(input)?;
    u32::try_from(value)
        .map_err(|_| DagError::InvalidArgument(format!("varint {value} does not fit in u32")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arbor_store::{InMemoryObjectStore, ObjectStore, RevTreeBuilder};
    use arbor_types::{Envelope, ObjectId};
    use proptest::prelude::*;

    fn node(name: &str) -> Node {
        Node::feature(name, ObjectId::from_bytes(name.as_bytes()))
    }

    #[test]
    fn magic_bytes() {
        assert_eq!(DagNode::direct(node("a")).to_bytes()[0], 0x01);
        assert_eq!(DagNode::lazy(NodeKind::Tree, 1, 2).to_bytes(), vec![0x02, 1, 2]);
        assert_eq!(DagNode::lazy(NodeKind::Feature, 1, 2).to_bytes(), vec![0x03, 1, 2]);
    }

    #[test]
    fn unknown_magic_is_rejected() {
        assert!(matches!(DagNode::from_bytes(&[0x09]), Err(DagError::InvalidMagic(0x09))));
    }

    #[test]
    fn only_direct_nodes_are_tombstones() {
        assert!(DagNode::direct(Node::tombstone("x")).is_tombstone());
        assert!(!DagNode::direct(node("x")).is_tombstone());
        assert!(!DagNode::lazy(NodeKind::Feature, 0, 0).is_tombstone());
    }

    #[test]
    fn lazy_nodes_resolve_through_cache() {
        let sub = Node::tree("sub", RevTreeBuilder::new().build().id());
        let tree = Arc::new(
            RevTreeBuilder::new()
                .feature(node("f1"))
                .tree(sub.clone(), 0)
                .build(),
        );
        let store = InMemoryObjectStore::new();
        store.write_tree(&tree).unwrap();
        let cache = TreeCache::new(Arc::new(store), 4).unwrap();
        let handle = cache.get_tree_id(&tree).unwrap();

        let feature = DagNode::lazy(NodeKind::Feature, handle, 0);
        assert_eq!(feature.resolve(&cache).unwrap(), tree.features()[0]);
        let subtree = DagNode::lazy(NodeKind::Tree, handle, 0);
        assert_eq!(subtree.resolve(&cache).unwrap(), sub);

        let past_end = DagNode::lazy(NodeKind::Feature, handle, 5);
        assert!(matches!(
            past_end.resolve(&cache),
            Err(DagError::IndexOutOfBounds { index: 5, len: 1, .. })
        ));
    }

    proptest! {
        #[test]
        fn lazy_roundtrip(handle in any::<u32>(), index in any::<u32>(), tree in any::<bool>()) {
            let kind = if tree { NodeKind::Tree } else { NodeKind::Feature };
            let value = DagNode::lazy(kind, handle, index);
            prop_assert_eq!(DagNode::from_bytes(&value.to_bytes()).unwrap(), value);
        }

        #[test]
        fn direct_roundtrip(name in "[a-z]{1,12}", x in -180.0f64..180.0, y in -90.0f64..90.0) {
            let value = DagNode::direct(node(&name).with_bounds(Envelope::point(x, y)));
            prop_assert_eq!(DagNode::from_bytes(&value.to_bytes()).unwrap(), value);
        }
    }
}

use std::collections::BTreeMap;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use arbor_types::codec::{read_exact, read_str, read_u8, write_str};
use arbor_types::{fnv1a64, ContentHasher, Envelope, ObjectId, TypeError};

use crate::error::{StoreError, StoreResult};

/// Whether an entry points at a nested tree or at a feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Tree,
    Feature,
}

impl NodeKind {
    fn to_byte(self) -> u8 {
        match self {
            NodeKind::Tree => 0,
            NodeKind::Feature => 1,
        }
    }

    fn from_byte(b: u8) -> StoreResult<Self> {
        match b {
            0 => Ok(NodeKind::Tree),
            1 => Ok(NodeKind::Feature),
            other => Err(StoreError::Serialization(format!(
                "invalid node kind {other}"
            ))),
        }
    }
}

/// A named entry of an immutable tree.
///
/// A node whose `object_id` is null is a tombstone: putting it into a
/// clustering session removes the entry with that name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub object_id: ObjectId,
    pub metadata_id: Option<ObjectId>,
    pub bounds: Option<Envelope>,
}

impl Node {
    pub fn new(name: impl Into<String>, kind: NodeKind, object_id: ObjectId) -> Self {
        Self {
            name: name.into(),
            kind,
            object_id,
            metadata_id: None,
            bounds: None,
        }
    }

    pub fn feature(name: impl Into<String>, object_id: ObjectId) -> Self {
        Self::new(name, NodeKind::Feature, object_id)
    }

    pub fn tree(name: impl Into<String>, object_id: ObjectId) -> Self {
        Self::new(name, NodeKind::Tree, object_id)
    }

    /// Deletion marker for `name`.
    pub fn tombstone(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Feature, ObjectId::NULL)
    }

    pub fn with_bounds(mut self, bounds: Envelope) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn with_metadata(mut self, metadata_id: ObjectId) -> Self {
        self.metadata_id = Some(metadata_id);
        self
    }

    /// Same entry pointing at a different object.
    pub fn update(&self, object_id: ObjectId) -> Node {
        Node {
            object_id,
            ..self.clone()
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.object_id.is_null()
    }

    /// Append the binary encoding of this node.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        write_str(buf, &self.name);
        buf.push(self.kind.to_byte());
        buf.extend_from_slice(self.object_id.as_bytes());
        match &self.metadata_id {
            Some(id) => {
                buf.push(1);
                buf.extend_from_slice(id.as_bytes());
            }
            None => buf.push(0),
        }
        write_bounds(buf, self.bounds.as_ref());
    }

    pub fn read_from(input: &mut &[u8]) -> StoreResult<Node> {
        let name = read_str(input)?;
        let kind = NodeKind::from_byte(read_u8(input)?)?;
        let object_id = ObjectId::from_slice(read_exact(input, ObjectId::LEN, "object id")?)?;
        let metadata_id = match read_u8(input)? {
            0 => None,
            _ => Some(ObjectId::from_slice(read_exact(
                input,
                ObjectId::LEN,
                "metadata id",
            )?)?),
        };
        let bounds = read_bounds(input)?;
        Ok(Node {
            name,
            kind,
            object_id,
            metadata_id,
            bounds,
        })
    }
}

fn write_bounds(buf: &mut Vec<u8>, bounds: Option<&Envelope>) {
    match bounds {
        Some(env) => {
            buf.push(1);
            for v in [env.min_x, env.min_y, env.max_x, env.max_y] {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        None => buf.push(0),
    }
}

fn read_bounds(input: &mut &[u8]) -> Result<Option<Envelope>, TypeError> {
    if read_u8(input)? == 0 {
        return Ok(None);
    }
    let mut coords = [0f64; 4];
    for c in coords.iter_mut() {
        let bytes = read_exact(input, 8, "bounds")?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        *c = f64::from_le_bytes(arr);
    }
    Ok(Some(Envelope {
        min_x: coords[0],
        min_y: coords[1],
        max_x: coords[2],
        max_y: coords[3],
    }))
}

/// Pointer from a bucketed tree to one of its subtrees.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub tree_id: ObjectId,
    pub bounds: Option<Envelope>,
}

static EMPTY_TREE: LazyLock<RevTree> = LazyLock::new(|| RevTreeBuilder::new().build());

/// Immutable, content-addressed tree.
///
/// A tree either lists its entries directly (a leaf) or points at up to one
/// subtree per bucket index. Bucketed trees may additionally carry direct
/// entries that could not be pushed down into any bucket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RevTree {
    id: ObjectId,
    size: u64,
    num_trees: u64,
    entry_count: u64,
    trees: Vec<Node>,
    features: Vec<Node>,
    buckets: BTreeMap<u8, Bucket>,
}

impl RevTree {
    /// The tree with no entries.
    pub fn empty() -> RevTree {
        EMPTY_TREE.clone()
    }

    pub fn empty_id() -> ObjectId {
        EMPTY_TREE.id
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Number of features reachable from this tree, nested trees included.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of tree entries, summed across buckets.
    pub fn num_trees(&self) -> u64 {
        self.num_trees
    }

    /// Number of entries at this tree level, summed across buckets.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn trees(&self) -> &[Node] {
        &self.trees
    }

    pub fn features(&self) -> &[Node] {
        &self.features
    }

    pub fn buckets(&self) -> &BTreeMap<u8, Bucket> {
        &self.buckets
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn is_leaf(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Union of the bounds of every direct entry and bucket.
    pub fn bounds(&self) -> Option<Envelope> {
        let nodes = self.trees.iter().chain(&self.features).filter_map(|n| n.bounds);
        let buckets = self.buckets.values().filter_map(|b| b.bounds);
        nodes.chain(buckets).reduce(|a, b| a.union(&b))
    }

    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Decode a tree and check that its content still hashes to its id.
    pub fn from_bytes(data: &[u8]) -> StoreResult<RevTree> {
        let tree: RevTree =
            bincode::deserialize(data).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let computed = tree.compute_id();
        if computed != tree.id {
            return Err(StoreError::CorruptObject {
                id: tree.id,
                reason: format!("content hashes to {computed}"),
            });
        }
        Ok(tree)
    }

    fn compute_id(&self) -> ObjectId {
        let mut buf = Vec::new();
        arbor_types::codec::write_varint(&mut buf, self.size);
        arbor_types::codec::write_varint(&mut buf, self.num_trees);
        arbor_types::codec::write_varint(&mut buf, self.entry_count);
        for list in [&self.trees, &self.features] {
            arbor_types::codec::write_varint(&mut buf, list.len() as u64);
            for node in list.iter() {
                node.write_to(&mut buf);
            }
        }
        arbor_types::codec::write_varint(&mut buf, self.buckets.len() as u64);
        for (index, bucket) in &self.buckets {
            buf.push(*index);
            buf.extend_from_slice(bucket.tree_id.as_bytes());
            write_bounds(&mut buf, bucket.bounds.as_ref());
        }
        ContentHasher::TREE.hash(&buf)
    }
}

/// Accumulates entries and buckets, then computes sizes and the tree id.
#[derive(Debug, Default)]
pub struct RevTreeBuilder {
    size: u64,
    num_trees: u64,
    entry_count: u64,
    trees: Vec<Node>,
    features: Vec<Node>,
    buckets: BTreeMap<u8, Bucket>,
}

impl RevTreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tree entry whose own tree holds `subtree_size` features.
    pub fn tree(mut self, node: Node, subtree_size: u64) -> Self {
        self.size += subtree_size;
        self.num_trees += 1;
        self.entry_count += 1;
        self.trees.push(node);
        self
    }

    pub fn feature(mut self, node: Node) -> Self {
        self.size += 1;
        self.entry_count += 1;
        self.features.push(node);
        self
    }

    /// Point bucket `index` at `tree`. Empty trees are skipped.
    pub fn bucket(mut self, index: u8, tree: &RevTree) -> Self {
        if tree.is_empty() {
            return self;
        }
        self.size += tree.size;
        self.num_trees += tree.num_trees;
        self.entry_count += tree.entry_count;
        self.buckets.insert(
            index,
            Bucket {
                tree_id: tree.id,
                bounds: tree.bounds(),
            },
        );
        self
    }

    pub fn build(mut self) -> RevTree {
        let order = |n: &Node| (fnv1a64(&n.name), n.name.clone());
        self.trees.sort_by_cached_key(order);
        self.features.sort_by_cached_key(order);
        let mut tree = RevTree {
            id: ObjectId::NULL,
            size: self.size,
            num_trees: self.num_trees,
            entry_count: self.entry_count,
            trees: self.trees,
            features: self.features,
            buckets: self.buckets,
        };
        tree.id = tree.compute_id();
        tree
    }
}

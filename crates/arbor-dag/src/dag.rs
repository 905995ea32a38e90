//! The mutable overlay node and its persistent record format.
//!
//! A [`Dag`] mirrors one tree of the clustered structure. It either lists
//! its entries directly (`children`) or routes them to bucket DAGs one level
//! deeper (`buckets`). Entries that cannot move deeper at this level are kept
//! in `non_promotable`, which may coexist with buckets.
//!
//! Record layout (the tree id is the storage key and is not encoded):
//!
//! ```text
//! original tree id   32 bytes
//! state              1 byte
//! child count        varint
//! #non-promotable, #children, #buckets   3 varints
//! non-promotable ids, then children ids  tagged node ids
//! bucket ids         varint length + path bytes each
//! ```

use std::collections::BTreeSet;

use arbor_store::RevTree;
use arbor_types::codec::{read_bytes, read_exact, read_node_id, read_u8, read_varint};
use arbor_types::codec::{write_bytes, write_node_id, write_varint};
use arbor_types::{NodeId, ObjectId, TreeId};

use crate::error::{DagError, DagResult};

/// Lifecycle of a DAG. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DagState {
    /// Created, original tree not yet copied in.
    Initialized,
    /// Structure copied from the original tree, nothing changed yet.
    Mirrored,
    /// Structurally modified; must be rebuilt.
    Changed,
}

impl DagState {
    fn to_byte(self) -> u8 {
        match self {
            DagState::Initialized => 0,
            DagState::Mirrored => 1,
            DagState::Changed => 2,
        }
    }

    fn from_byte(b: u8) -> DagResult<Self> {
        match b {
            0 => Ok(DagState::Initialized),
            1 => Ok(DagState::Mirrored),
            2 => Ok(DagState::Changed),
            other => Err(DagError::InvalidState(other)),
        }
    }
}

/// Mutable overlay node.
///
/// `mutated` records whether this copy differs from what its storage
/// provider last saw; providers skip clean DAGs on save.
#[derive(Clone, Debug)]
pub struct Dag {
    id: TreeId,
    original_tree_id: ObjectId,
    state: DagState,
    child_count: u64,
    children: BTreeSet<NodeId>,
    non_promotable: BTreeSet<NodeId>,
    buckets: BTreeSet<TreeId>,
    mutated: bool,
}

impl Dag {
    /// A fresh DAG mirroring `original_tree_id`. A null id means the empty tree.
    pub fn new(id: TreeId, original_tree_id: ObjectId) -> Self {
        let original_tree_id = if original_tree_id.is_null() {
            RevTree::empty_id()
        } else {
            original_tree_id
        };
        Self {
            id,
            original_tree_id,
            state: DagState::Initialized,
            child_count: 0,
            children: BTreeSet::new(),
            non_promotable: BTreeSet::new(),
            buckets: BTreeSet::new(),
            mutated: true,
        }
    }

    pub fn id(&self) -> &TreeId {
        &self.id
    }

    pub fn original_tree_id(&self) -> ObjectId {
        self.original_tree_id
    }

    pub fn state(&self) -> DagState {
        self.state
    }

    /// Entries reachable from this DAG, across all buckets.
    pub fn child_count(&self) -> u64 {
        self.child_count
    }

    pub fn children(&self) -> &BTreeSet<NodeId> {
        &self.children
    }

    pub fn non_promotable(&self) -> &BTreeSet<NodeId> {
        &self.non_promotable
    }

    pub fn buckets(&self) -> &BTreeSet<TreeId> {
        &self.buckets
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// A routing DAG forwards new entries instead of listing them.
    pub fn is_routing(&self) -> bool {
        !self.buckets.is_empty() || !self.non_promotable.is_empty()
    }

    pub fn is_mutated(&self) -> bool {
        self.mutated
    }

    pub(crate) fn mark_clean(&mut self) {
        self.mutated = false;
    }

    // ---------------------------------------------------------------
    // Mutation
    // ---------------------------------------------------------------

    pub fn add_child(&mut self, id: NodeId) -> bool {
        let added = self.children.insert(id);
        self.mutated |= added;
        added
    }

    pub fn remove_child(&mut self, id: &NodeId) -> bool {
        let removed = self.children.remove(id);
        self.mutated |= removed;
        removed
    }

    /// Remove and return every direct child.
    pub fn take_children(&mut self) -> BTreeSet<NodeId> {
        if !self.children.is_empty() {
            self.mutated = true;
        }
        std::mem::take(&mut self.children)
    }

    pub fn add_non_promotable(&mut self, id: NodeId) -> bool {
        let added = self.non_promotable.insert(id);
        self.mutated |= added;
        added
    }

    pub fn remove_non_promotable(&mut self, id: &NodeId) -> bool {
        let removed = self.non_promotable.remove(id);
        self.mutated |= removed;
        removed
    }

    pub fn take_non_promotable(&mut self) -> BTreeSet<NodeId> {
        if !self.non_promotable.is_empty() {
            self.mutated = true;
        }
        std::mem::take(&mut self.non_promotable)
    }

    pub fn add_bucket(&mut self, id: TreeId) -> bool {
        let added = self.buckets.insert(id);
        self.mutated |= added;
        added
    }

    pub fn remove_bucket(&mut self, id: &TreeId) -> bool {
        let removed = self.buckets.remove(id);
        self.mutated |= removed;
        removed
    }

    pub fn take_buckets(&mut self) -> BTreeSet<TreeId> {
        if !self.buckets.is_empty() {
            self.mutated = true;
        }
        std::mem::take(&mut self.buckets)
    }

    pub fn set_child_count(&mut self, count: u64) {
        if self.child_count != count {
            self.child_count = count;
            self.mutated = true;
        }
    }

    pub fn set_mirrored(&mut self) {
        if self.state == DagState::Initialized {
            self.state = DagState::Mirrored;
            self.mutated = true;
        }
    }

    pub fn set_changed(&mut self) {
        if self.state != DagState::Changed {
            self.state = DagState::Changed;
            self.mutated = true;
        }
    }

    /// Empty this DAG after its entries were pulled up into an ancestor.
    ///
    /// It no longer mirrors anything, so a later split starts from scratch.
    pub fn reset(&mut self) {
        self.original_tree_id = RevTree::empty_id();
        self.child_count = 0;
        self.children.clear();
        self.non_promotable.clear();
        self.buckets.clear();
        self.state = DagState::Changed;
        self.mutated = true;
    }

    // ---------------------------------------------------------------
    // Encoding
    // ---------------------------------------------------------------

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.original_tree_id.as_bytes());
        buf.push(self.state.to_byte());
        write_varint(buf, self.child_count);
        write_varint(buf, self.non_promotable.len() as u64);
        write_varint(buf, self.children.len() as u64);
        write_varint(buf, self.buckets.len() as u64);
        for id in self.non_promotable.iter().chain(&self.children) {
            write_node_id(buf, id);
        }
        for bucket in &self.buckets {
            write_bytes(buf, bucket.as_bytes());
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf);
        buf
    }

    /// Decode the record stored under `id`. The result is clean.
    pub fn from_bytes(id: TreeId, mut data: &[u8]) -> DagResult<Dag> {
        let input = &mut data;
        let original_tree_id =
            ObjectId::from_slice(read_exact(input, ObjectId::LEN, "original tree id")?)?;
        let state = DagState::from_byte(read_u8(input)?)?;
        let child_count = read_varint(input)?;
        let np_count = read_varint(input)?;
        let children_count = read_varint(input)?;
        let bucket_count = read_varint(input)?;

        let mut non_promotable = BTreeSet::new();
        for _ in 0..np_count {
            non_promotable.insert(read_node_id(input)?);
        }
        let mut children = BTreeSet::new();
        for _ in 0..children_count {
            children.insert(read_node_id(input)?);
        }
        let mut buckets = BTreeSet::new();
        for _ in 0..bucket_count {
            buckets.insert(TreeId::from_slice(read_bytes(input)?));
        }

        Ok(Dag {
            id,
            original_tree_id,
            state,
            child_count,
            children,
            non_promotable,
            buckets,
            mutated: false,
        })
    }
}

impl PartialEq for Dag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.original_tree_id == other.original_tree_id
            && self.state == other.state
            && self.child_count == other.child_count
            && self.children == other.children
            && self.non_promotable == other.non_promotable
            && self.buckets == other.buckets
    }
}

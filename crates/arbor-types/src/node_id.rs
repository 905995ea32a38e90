//! Entry identifiers and their bucket addressing.
//!
//! A [`NodeId`] is the key an entry is stored under inside the clustered
//! tree. Two addressing schemes exist:
//!
//! - **Canonical**: buckets are consecutive 3-bit groups of the 64-bit
//!   FNV-1a hash of the entry name, most significant first. Every canonical
//!   id is routable down to [`CANONICAL_MAX_DEPTH`] levels.
//! - **Quadrant**: buckets are the quadrants obtained by repeatedly halving
//!   the index bounds while the entry's bounds still fit one quadrant. Past
//!   the end of that path the id cannot be promoted any deeper.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use fnv::FnvHasher;

use crate::spatial::Quadrant;

/// Number of 3-bit bucket levels a 64-bit hash provides.
pub const CANONICAL_MAX_DEPTH: usize = 21;

/// 64-bit FNV-1a hash of an entry name's UTF-8 bytes.
pub fn fnv1a64(name: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(name.as_bytes());
    hasher.finish()
}

/// Identifier of a single entry, tagged with its addressing scheme.
///
/// Equality, hashing and ordering only look at the scheme and the name. The
/// ordering sorts by name hash first, so the canonical order is the order
/// in which buckets are laid out.
#[derive(Clone)]
pub enum NodeId {
    Canonical {
        name: String,
        hash: u64,
    },
    Quadrant {
        name: String,
        hash: u64,
        quadrants: Vec<Quadrant>,
    },
}

impl NodeId {
    pub fn canonical(name: impl Into<String>) -> Self {
        let name = name.into();
        let hash = fnv1a64(&name);
        NodeId::Canonical { name, hash }
    }

    pub fn quadrant(name: impl Into<String>, quadrants: Vec<Quadrant>) -> Self {
        let name = name.into();
        let hash = fnv1a64(&name);
        NodeId::Quadrant {
            name,
            hash,
            quadrants,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            NodeId::Canonical { name, .. } | NodeId::Quadrant { name, .. } => name,
        }
    }

    /// FNV-1a hash of the name.
    pub fn hash_bits(&self) -> u64 {
        match self {
            NodeId::Canonical { hash, .. } | NodeId::Quadrant { hash, .. } => *hash,
        }
    }

    /// Quadrant path; empty for canonical ids.
    pub fn quadrants(&self) -> &[Quadrant] {
        match self {
            NodeId::Canonical { .. } => &[],
            NodeId::Quadrant { quadrants, .. } => quadrants,
        }
    }

    pub fn is_canonical(&self) -> bool {
        matches!(self, NodeId::Canonical { .. })
    }

    /// Bucket this id falls into at `depth`, or `None` when it cannot be
    /// promoted that deep.
    pub fn bucket(&self, depth: usize) -> Option<u8> {
        match self {
            NodeId::Canonical { hash, .. } => {
                if depth >= CANONICAL_MAX_DEPTH {
                    return None;
                }
                let shift = 61 - 3 * depth as u32;
                Some(((hash >> shift) & 0b111) as u8)
            }
            NodeId::Quadrant { quadrants, .. } => quadrants.get(depth).map(|q| q.index()),
        }
    }

    fn scheme_rank(&self) -> u8 {
        match self {
            NodeId::Canonical { .. } => 0,
            NodeId::Quadrant { .. } => 1,
        }
    }
}

impl PartialEq for NodeId {
    fn eq(&self, other: &Self) -> bool {
        self.scheme_rank() == other.scheme_rank() && self.name() == other.name()
    }
}

impl Eq for NodeId {}

impl Hash for NodeId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.scheme_rank().hash(state);
        self.name().hash(state);
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.scheme_rank()
            .cmp(&other.scheme_rank())
            .then_with(|| self.hash_bits().cmp(&other.hash_bits()))
            .then_with(|| self.name().cmp(other.name()))
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Canonical { name, .. } => write!(f, "NodeId({name})"),
            NodeId::Quadrant {
                name, quadrants, ..
            } => {
                let path: Vec<u8> = quadrants.iter().map(|q| q.index()).collect();
                write!(f, "NodeId({name} @ {path:?})")
            }
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn fnv_matches_reference_vectors() {
        assert_eq!(fnv1a64(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64("a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a64("foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn canonical_buckets_are_hash_bit_groups() {
        let id = NodeId::canonical("feature.42");
        let hash = id.hash_bits();
        assert_eq!(id.bucket(0), Some((hash >> 61) as u8));
        assert_eq!(id.bucket(1), Some(((hash >> 58) & 7) as u8));
        assert_eq!(id.bucket(20), Some(((hash >> 1) & 7) as u8));
        assert_eq!(id.bucket(CANONICAL_MAX_DEPTH), None);
        for depth in 0..CANONICAL_MAX_DEPTH {
            assert!(id.bucket(depth).unwrap() < 8);
        }
    }

    #[test]
    fn quadrant_buckets_end_with_path() {
        let id = NodeId::quadrant(
            "parcel",
            vec![Quadrant::NorthEast, Quadrant::SouthWest],
        );
        assert_eq!(id.bucket(0), Some(2));
        assert_eq!(id.bucket(1), Some(0));
        assert_eq!(id.bucket(2), None);
        assert_eq!(id.quadrants().len(), 2);
    }

    #[test]
    fn identity_ignores_quadrant_path() {
        let a = NodeId::quadrant("p", vec![Quadrant::NorthEast]);
        let b = NodeId::quadrant("p", vec![]);
        assert_eq!(a, b);
        assert_ne!(a, NodeId::canonical("p"));
    }

    #[test]
    fn id_computation_is_idempotent() {
        assert_eq!(NodeId::canonical("road"), NodeId::canonical("road"));
        assert_eq!(
            NodeId::canonical("road").hash_bits(),
            NodeId::canonical("road").hash_bits()
        );
    }

    #[test]
    fn canonical_order_follows_bucket_order() {
        let ids: BTreeSet<NodeId> = (0..500).map(|i| NodeId::canonical(format!("f{i}"))).collect();
        let ordered: Vec<&NodeId> = ids.iter().collect();
        for pair in ordered.windows(2) {
            assert!(pair[0].hash_bits() <= pair[1].hash_bits());
            let b0: Vec<u8> = (0..CANONICAL_MAX_DEPTH).filter_map(|d| pair[0].bucket(d)).collect();
            let b1: Vec<u8> = (0..CANONICAL_MAX_DEPTH).filter_map(|d| pair[1].bucket(d)).collect();
            assert!(b0 <= b1);
        }
    }
}

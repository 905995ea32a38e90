//! Foundation types for the arbor tree store.
//!
//! Every other arbor crate depends on `arbor-types`. It defines how objects,
//! tree positions and entries are identified, and the compact binary codecs
//! used to persist those identifiers.
//!
//! # Key Types
//!
//! - [`ObjectId`] -- Content-addressed identifier (BLAKE3 hash)
//! - [`ContentHasher`] -- Domain-separated hashing for stored objects
//! - [`TreeId`] -- Bucket path of a node inside the clustered tree
//! - [`NodeId`] -- Ordering key of a single entry, canonical or quadrant-addressed
//! - [`Envelope`] / [`Quadrant`] -- 2D bounds and their quadrant subdivision

pub mod codec;
pub mod error;
pub mod hasher;
pub mod node_id;
pub mod object;
pub mod spatial;
pub mod tree_id;

pub use error::{TypeError, TypeResult};
pub use hasher::ContentHasher;
pub use node_id::{fnv1a64, NodeId, CANONICAL_MAX_DEPTH};
pub use object::ObjectId;
pub use spatial::{Envelope, Quadrant};
pub use tree_id::TreeId;

//! Immutable tree storage for the arbor tree store.
//!
//! This crate holds the content-addressed side of the system: the immutable
//! [`RevTree`] and its [`Node`] entries, the [`ObjectStore`] they live in,
//! and the ordered [`KvBackend`] tables the mutable overlay spills to.
//!
//! # Storage Backends
//!
//! - [`InMemoryObjectStore`] -- `HashMap`-based object store for tests and embedding
//! - [`KvObjectStore`] -- object store over any [`KvBackend`]
//! - [`MemoryKvBackend`] -- ordered in-memory tables
//! - [`LogKvBackend`] -- one CRC-framed append log per table, indexed in memory
//!
//! # Design Rules
//!
//! 1. Trees are immutable once written; the id is the hash of the content.
//! 2. The empty tree is never stored; every store resolves its id implicitly.
//! 3. All I/O errors are propagated, never silently ignored.

pub mod error;
pub mod kv;
pub mod log;
pub mod memory;
pub mod object;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use kv::{KvBackend, KvObjectStore, MemoryKvBackend, WriteBatch};
pub use log::{KvConfig, LogKvBackend, SyncMode};
pub use memory::InMemoryObjectStore;
pub use object::{Bucket, Node, NodeKind, RevTree, RevTreeBuilder};
pub use traits::ObjectStore;

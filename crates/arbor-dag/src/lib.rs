//! Mutable overlay for rebuilding large content-addressed trees.
//!
//! Rewriting a clustered immutable tree on every insert is not feasible
//! when it holds millions of entries. A [`ClusteringStrategy`] instead
//! mirrors the original [`RevTree`](arbor_store::RevTree) lazily, only along
//! the paths that are touched, and applies inserts, removals, splits and
//! collapses to mutable [`Dag`] nodes. [`DagTreeBuilder`] then rebuilds a new
//! immutable tree bottom-up in parallel, reusing every untouched subtree.
//!
//! # Components
//!
//! - [`Clustering`] -- bucket addressing ([`CanonicalClustering`], [`QuadTreeClustering`])
//! - [`ClusteringStrategy`] -- put/remove session over a storage provider
//! - [`DagStorageProvider`] -- heap, persistent and tiered storage of DAGs and entry values
//! - [`TreeCache`] -- interned handles for lazily referenced original trees
//! - [`BackgroundingNodeStore`] -- write-behind decorator for entry stores
//! - [`DagTreeBuilder`] -- parallel, cancellable rebuild

pub mod background;
pub mod builder;
pub mod clustering;
pub mod config;
pub mod dag;
pub mod error;
pub mod node;
pub mod storage;
pub mod strategy;
pub mod tree_cache;

pub use background::BackgroundingNodeStore;
pub use builder::DagTreeBuilder;
pub use clustering::{CanonicalClustering, Clustering, QuadTreeClustering};
pub use config::DagConfig;
pub use dag::{Dag, DagState};
pub use error::{DagError, DagResult};
pub use node::DagNode;
pub use storage::{
    CachingStorageProvider, DagStorageProvider, HeapStorageProvider, KvNodeStore, NodeStore,
    PersistentStorageProvider,
};
pub use strategy::ClusteringStrategy;
pub use tree_cache::TreeCache;

//! Tuning knobs for clustering sessions and their storage.

use serde::{Deserialize, Serialize};

use crate::error::{DagError, DagResult};

/// Thresholds and capacities used by strategies, providers and the builder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DagConfig {
    /// Buffered DAGs a strategy holds before flushing them to its provider.
    pub buffered_dag_limit: usize,
    /// Pending writes the persistent provider accumulates before a batch write.
    pub persistent_flush_threshold: usize,
    /// Deepest tree id the caching provider keeps on the heap.
    pub heap_depth_threshold: usize,
    /// Heap-resident entry values before the caching provider swaps to disk.
    pub heap_node_threshold: usize,
    /// Original trees kept resident by the tree cache.
    pub tree_cache_capacity: usize,
    /// New trees the builder batches before writing them to the object store.
    pub builder_flush_threshold: usize,
    /// Queued batches the background writer accepts before blocking producers.
    pub background_queue_capacity: usize,
    /// Whether persistent entry writes go through a background writer.
    pub background_writes: bool,
}

impl Default for DagConfig {
    fn default() -> Self {
        Self {
            buffered_dag_limit: 10_000,
            persistent_flush_threshold: 1_000,
            heap_depth_threshold: 3,
            heap_node_threshold: 100_000,
            tree_cache_capacity: 4_096,
            builder_flush_threshold: 1_000,
            background_queue_capacity: 64,
            background_writes: true,
        }
    }
}

impl DagConfig {
    /// Parse a TOML document; missing keys take their default.
    pub fn from_toml(source: &str) -> DagResult<Self> {
        let config: DagConfig =
            toml::from_str(source).map_err(|e| DagError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DagResult<()> {
        let positive = [
            ("buffered_dag_limit", self.buffered_dag_limit),
            ("persistent_flush_threshold", self.persistent_flush_threshold),
            ("heap_node_threshold", self.heap_node_threshold),
            ("tree_cache_capacity", self.tree_cache_capacity),
            ("builder_flush_threshold", self.builder_flush_threshold),
            ("background_queue_capacity", self.background_queue_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(DagError::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DagConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffered_dag_limit, 10_000);
        assert_eq!(config.heap_depth_threshold, 3);
        assert_eq!(config.heap_node_threshold, 100_000);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = DagConfig::from_toml(
            r#"
            heap_node_threshold = 500
            background_writes = false
            "#,
        )
        .unwrap();
        assert_eq!(config.heap_node_threshold, 500);
        assert!(!config.background_writes);
        assert_eq!(config.persistent_flush_threshold, 1_000);
    }

    #[test]
    fn zero_thresholds_are_rejected() {
        let err = DagConfig::from_toml("builder_flush_threshold = 0").unwrap_err();
        assert!(matches!(err, DagError::Config(msg) if msg.contains("builder_flush_threshold")));
    }

    #[test]
    fn malformed_toml_is_rejected() {
        assert!(matches!(
            DagConfig::from_toml("heap_depth_threshold = \"deep\""),
            Err(DagError::Config(_))
        ));
    }
}

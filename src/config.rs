//! Indexer configuration.
//!
//! A plain struct with a hand-written `Default` — no config-file crate is
//! involved since the core takes its configuration as Rust values from its
//! embedding process, not from a file or environment.

use std::path::PathBuf;

use crate::shard::DEFAULT_NUM_SHARDS;

/// Soft cap on documents per segment before a flush is triggered.
pub const DEFAULT_SEGMENT_DOCS: usize = 500_000;
/// Soft cap on estimated live bytes per segment before a flush is triggered.
pub const DEFAULT_SEGMENT_BYTES: usize = 500 * 1024 * 1024;
/// Advisory batch size hint for callers.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Directory segment files are written to.
    pub out_dir: PathBuf,
    /// Worker pool size. Clamped to `[1, 128]`.
    pub num_workers: usize,
    /// Shard fan-out; must be a power of two.
    pub num_shards: usize,
    /// Soft cap on docs per segment.
    pub segment_docs: usize,
    /// Soft cap on estimated live bytes per segment.
    pub segment_bytes: usize,
    /// Advisory batch size; the indexer does not enforce this.
    pub batch_size: usize,
}

impl IndexerConfig {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            ..Self::default()
        }
    }

    /// Panics if `num_shards` is not a power of two — this is a programmer
    /// error caught at construction, not a runtime `InvalidInput`.
    pub fn validate(&self) {
        assert!(
            self.num_shards.is_power_of_two(),
            "num_shards must be a power of two, got {}",
            self.num_shards
        );
        assert!(self.num_workers >= 1, "num_workers must be at least 1");
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().clamp(1, 128);
        Self {
            out_dir: PathBuf::from("."),
            num_workers: cpus,
            num_shards: DEFAULT_NUM_SHARDS,
            segment_docs: DEFAULT_SEGMENT_DOCS,
            segment_bytes: DEFAULT_SEGMENT_BYTES,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_num_workers_is_clamped() {
        let cfg = IndexerConfig::default();
        assert!(cfg.num_workers >= 1 && cfg.num_workers <= 128);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn validate_rejects_non_power_of_two_shards() {
        let mut cfg = IndexerConfig::new("/tmp");
        cfg.num_shards = 300;
        cfg.validate();
    }
}

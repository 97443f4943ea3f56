//! # Config - Pool engine tunables
//!
//! All knobs that shape the log space map machinery live here as one plain
//! struct, so the engine takes a single value instead of a bag of loose
//! parameters. Defaults mirror the values the flushing algorithm was tuned
//! with in production; tests override individual fields to force specific
//! behaviours (tiny block limits, disabled flush floors, simulated crashes).
//!
//! ## Example
//! ```rust
//! use config::Tunables;
//!
//! let mut tun = Tunables::default();
//! tun.min_metaslabs_to_flush = 0;
//! assert_eq!(tun.log_block_min, 1000);
//! ```

/// Tunables for the log space map engine.
///
/// The two memory fields combine into a single budget via
/// [`mem_budget`](Tunables::mem_budget); everything else is consumed directly
/// by the summary, the flush scheduler, or the load path.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Hard cap, in bytes, on the memory retained by unflushed change sets.
    pub max_mem_amt: u64,

    /// Soft cap on unflushed-change memory, in parts per million of
    /// [`system_memory`](Tunables::system_memory). The default of 1000
    /// allows 0.1% of system memory.
    pub max_mem_ppm: u64,

    /// Total system memory in bytes, the base for the ppm soft cap.
    /// Embedders should set this from the host; the default assumes a
    /// 16 GiB machine.
    pub system_memory: u64,

    /// Target number of log blocks, as a percentage of the number of dirty
    /// flushed metaslabs (400 = four log blocks per metaslab).
    pub log_block_pct: u64,

    /// Lower clamp for the block limit. Keeps small pools from flushing
    /// everything every TXG when their incoming rate is high.
    pub log_block_min: u64,

    /// Upper clamp for the block limit. Bounds pool import time.
    pub log_block_max: u64,

    /// Upper bound on the log's span in dirty TXGs.
    pub log_txg_max: u64,

    /// Maximum number of rows in the log summary. Longer summaries give the
    /// flushing algorithm more accuracy at higher traversal cost.
    pub max_summary_rows: u64,

    /// How many recent closed logs to average when estimating the incoming
    /// block rate for the current TXG.
    pub max_log_walking: u64,

    /// Floor on the number of metaslabs flushed per dirty TXG. Zero disables
    /// the floor entirely, leaving flushing to the two heuristics.
    pub min_metaslabs_to_flush: u64,

    /// Block size for log space map objects. Logs are written in large
    /// sequential batches, so they benefit from a big block.
    pub log_sm_blksz: u32,

    /// Byte budget of the load-time prefetch window; up to twice this many
    /// bytes of log space maps are read ahead of the replay cursor.
    pub prefetch_max_bytes: u64,

    /// Testing knob: leave logs on disk at export instead of flushing and
    /// destroying them, so the import paths can be exercised as if the pool
    /// had crashed.
    pub keep_log_spacemaps_at_export: bool,
}

impl Tunables {
    /// Memory budget for unflushed changes: the smaller of the hard cap and
    /// the ppm share of system memory.
    #[must_use]
    pub fn mem_budget(&self) -> u64 {
        let soft = self.system_memory.saturating_mul(self.max_mem_ppm) / 1_000_000;
        self.max_mem_amt.min(soft)
    }

    /// TXG span at which a summary row is considered full.
    #[must_use]
    pub fn summary_txgs_per_row(&self) -> u64 {
        self.log_txg_max.div_ceil(self.max_summary_rows)
    }

    /// Block count at which a summary row is considered full, for the given
    /// block limit.
    #[must_use]
    pub fn summary_blocks_per_row(&self, blocklimit: u64) -> u64 {
        1.max(blocklimit.div_ceil(self.max_summary_rows))
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            max_mem_amt: 1 << 30,
            max_mem_ppm: 1000,
            system_memory: 16 << 30,
            log_block_pct: 400,
            log_block_min: 1000,
            log_block_max: 1 << 17,
            log_txg_max: 1000,
            max_summary_rows: 10,
            max_log_walking: 5,
            min_metaslabs_to_flush: 1,
            log_sm_blksz: 1 << 17,
            prefetch_max_bytes: 128 << 20,
            keep_log_spacemaps_at_export: false,
        }
    }
}

#[cfg(test)]
mod tests;

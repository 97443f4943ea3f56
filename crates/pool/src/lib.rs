//! # Pool - the log space map engine
//!
//! The central aggregate tying together the [`rangeset`], [`spacemap`], and
//! [`mos`] crates into the pool's unflushed-change machinery: per-TXG log
//! space maps, per-metaslab unflushed change sets, the flush scheduler, and
//! import-time replay.
//!
//! ## Architecture
//!
//! ```text
//! alloc()/free() staging
//!   |
//!   v
//! ┌────────────────────────────────────────────────────────┐
//! │                        POOL                            │
//! │                                                        │
//! │ sync.rs   txg_sync():                                  │
//! │    flush_metaslabs()  → scheduler.rs picks how many    │
//! │       |                 metaslabs to drain, oldest     │
//! │       |                 watermark first                │
//! │       v                                                │
//! │    sync_staged_changes() → LOC records to the syncing  │
//! │       |                    log; XOR into unflushed     │
//! │       v                    sets                        │
//! │    close_syncing_log()  → block counts to registry.rs  │
//! │       |                   and summary.rs               │
//! │       v                                                │
//! │    cleanup_old_logs()   → destroy logs older than the  │
//! │                           oldest watermark             │
//! │                                                        │
//! │ load.rs   replay logs against watermarks at import     │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module responsibilities
//!
//! | Module         | Purpose                                            |
//! |----------------|----------------------------------------------------|
//! | `lib.rs`       | `Pool` struct, creation, staging, accessors        |
//! | [`registry`]   | Logs ordered by TXG + the syncing log handle       |
//! | [`summary`]    | Coarse rows bounding the scheduler's planning cost |
//! | [`scheduler`]  | Memory and block heuristics                        |
//! | [`metaslab`]   | Unflushed change sets and watermarks               |
//! | `sync.rs`      | The per-TXG pipeline and export                    |
//! | `load.rs`      | Import: prefetch, replay, accounting rebuild       |
//! | [`layout`]     | Persisted vdev/metaslab geometry                   |
//!
//! ## Concurrency
//!
//! The pool is owned and single-threaded: every sync-context mutation takes
//! `&mut self`, which replaces the lock ladder a kernel implementation
//! needs. Outside observers get an immutable [`PoolStats`] snapshot.
//! Durability ordering across TXGs (records durable before the uberblock
//! advances) is the surrounding transaction pipeline's contract.

mod layout;
mod load;
mod metaslab;
mod registry;
mod scheduler;
mod summary;
mod sync;

pub use layout::VdevLayout;
pub use mos::{Mos, Tx};
pub use summary::SummaryRow;

use config::Tunables;
use metaslab::{Metaslab, Vdev};
use mos::MosError;
use registry::LogRegistry;
use spacemap::{SpaceMap, SpaceMapError};
use std::collections::BTreeSet;
use summary::LogSummary;
use thiserror::Error;

/// Directory ZAP key naming the TXG-keyed log space map ZAP.
const DIR_KEY_LOG_SPACEMAP_ZAP: u64 = 1;
/// Directory ZAP key naming the pool layout record object.
const DIR_KEY_LAYOUT: u64 = 2;
/// Directory ZAP key holding the last synced TXG.
const DIR_KEY_LAST_TXG: u64 = 3;

/// Vdev top ZAP key naming the per-metaslab space map object array.
const VDEV_KEY_MS_ARRAY: u64 = 1;
/// Vdev top ZAP key naming the per-metaslab `unflushed_txg` array.
const VDEV_KEY_UNFLUSHED_TXGS: u64 = 2;

/// Unit shift for log space map records. Finer than any vdev's ashift, so
/// every vdev's extents encode losslessly.
const LOG_SM_SHIFT: u32 = 9;

/// Block size for per-metaslab space maps. Metaslab flushes are small and
/// incremental, unlike the large sequential log writes.
const MS_SM_BLKSZ: u32 = 4096;

/// Errors surfaced by the pool engine.
#[derive(Debug, Error)]
pub enum PoolError {
    /// An error from the backing object store.
    #[error(transparent)]
    Mos(#[from] MosError),

    /// An error reading or writing a space map.
    #[error(transparent)]
    SpaceMap(#[from] SpaceMapError),

    /// A metaslab watermark names a log that is not in the registry
    /// (fatal at load).
    #[error("no log space map registered for txg {txg}")]
    LogNotFound { txg: u64 },

    /// An attempt to destroy a log still referenced by metaslab watermarks.
    #[error("log space map for txg {txg} still referenced by {mscount} metaslabs")]
    Busy { txg: u64, mscount: u64 },

    /// Pool shutdown was requested while the load was in flight.
    #[error("shutdown requested during load")]
    Shutdown,

    /// An impossible counter state or malformed persistent record.
    #[error("corrupt pool state: {0}")]
    Corruption(&'static str),
}

/// Pool-wide unflushed-change statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnflushedStats {
    /// Total blocks across all log space maps.
    pub nblocks: u64,
    /// Bytes retained by all unflushed change sets.
    pub memused: u64,
    /// Current cap on log blocks, derived from the dirty metaslab count.
    pub blocklimit: u64,
}

/// An immutable snapshot of the pool's log state for outside observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub nblocks: u64,
    pub memused: u64,
    pub blocklimit: u64,
    /// Net allocated bytes across the pool, unflushed changes included.
    pub space_allocated: i64,
    /// The TXG the next sync will run as.
    pub txg: u64,
    /// Live log space maps in the registry.
    pub log_count: usize,
    /// Metaslabs with a nonzero watermark.
    pub flushed_metaslab_count: usize,
    /// Rows in the log summary.
    pub summary_rows: usize,
}

/// The pool engine. See the crate docs for the overall shape.
pub struct Pool {
    pub(crate) mos: Mos,
    pub(crate) tunables: Tunables,
    pub(crate) vdevs: Vec<Vdev>,
    pub(crate) registry: LogRegistry,
    pub(crate) summary: LogSummary,
    /// Metaslabs with outstanding watermarks, ordered by
    /// `(unflushed_txg, vdev, metaslab)`: flushing walks this oldest-first.
    pub(crate) by_flushed: BTreeSet<(u64, u32, u32)>,
    pub(crate) stats: UnflushedStats,
    /// The TXG the next sync will run as.
    pub(crate) txg: u64,
    /// Nonzero while a flush-everything request (export) is pending.
    pub(crate) flushall_txg: u64,
    /// The TXG-keyed log space map ZAP, 0 until the first log is created.
    pub(crate) log_zap: u64,
    pub(crate) space_allocated: i64,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("txg", &self.txg)
            .field("vdevs", &self.vdevs.len())
            .field("logs", &self.registry.len())
            .field("flushed_metaslabs", &self.by_flushed.len())
            .field("summary_rows", &self.summary.row_count())
            .field("stats", &self.stats)
            .field("flushall_txg", &self.flushall_txg)
            .finish()
    }
}

impl Pool {
    /// Creates a fresh pool over `mos` with the given vdev shapes.
    ///
    /// `initial_txg` is the TXG the first sync will run as; reloaded pools
    /// resume from their last synced TXG + 1.
    pub fn create(
        mut mos: Mos,
        layouts: &[VdevLayout],
        initial_txg: u64,
        tunables: Tunables,
    ) -> Result<Self, PoolError> {
        assert!(initial_txg > 0, "TXG numbering starts at 1");
        assert!(
            layouts.len() as u64 <= u64::from(spacemap::VDEV_MAX),
            "too many vdevs"
        );
        let tx = Tx::new(initial_txg - 1);

        let mut vdevs = Vec::with_capacity(layouts.len());
        let mut persisted = Vec::with_capacity(layouts.len());
        for layout in layouts {
            assert!(layout.ms_count > 0, "vdev with no metaslabs");
            assert!(
                layout.ashift >= LOG_SM_SHIFT,
                "ashift below the log record unit"
            );
            let span_units =
                (u64::from(layout.ms_count) << layout.ms_shift) >> LOG_SM_SHIFT;
            assert!(
                span_units <= spacemap::OFFSET_MAX + 1,
                "vdev too large for the record offset field"
            );

            let top_zap = mos.zap_create(&tx)?;
            let ms_array_obj = mos.object_create(MS_SM_BLKSZ, &tx)?;
            let unflushed_obj = mos.object_create(MS_SM_BLKSZ, &tx)?;
            let zeroes = vec![0u8; layout.ms_count as usize * 8];
            mos.write_at(ms_array_obj, 0, &zeroes, &tx)?;
            mos.write_at(unflushed_obj, 0, &zeroes, &tx)?;
            mos.zap_add(top_zap, VDEV_KEY_MS_ARRAY, ms_array_obj, &tx)?;
            mos.zap_add(top_zap, VDEV_KEY_UNFLUSHED_TXGS, unflushed_obj, &tx)?;

            vdevs.push(Vdev {
                ashift: layout.ashift,
                ms_shift: layout.ms_shift,
                top_zap,
                ms_array_obj,
                unflushed_obj,
                metaslabs: (0..layout.ms_count).map(|_| Metaslab::new()).collect(),
            });
            persisted.push((*layout, top_zap));
        }

        let layout_obj = mos.object_create(MS_SM_BLKSZ, &tx)?;
        mos.object_write(layout_obj, &layout::serialize_layout(&persisted), &tx)?;
        let dir = mos.directory();
        mos.zap_add(dir, DIR_KEY_LAYOUT, layout_obj, &tx)?;
        mos.zap_add(dir, DIR_KEY_LAST_TXG, initial_txg - 1, &tx)?;

        Ok(Self {
            mos,
            tunables,
            vdevs,
            registry: LogRegistry::default(),
            summary: LogSummary::default(),
            by_flushed: BTreeSet::new(),
            stats: UnflushedStats::default(),
            txg: initial_txg,
            flushall_txg: 0,
            log_zap: 0,
            space_allocated: 0,
        })
    }

    /// Opens a transaction for the next TXG.
    ///
    /// All staging and the eventual [`txg_sync`](Pool::txg_sync) must use
    /// this handle.
    #[must_use]
    pub fn txg_begin(&self) -> Tx {
        Tx::new(self.txg)
    }

    /// Stages an allocation of `[offset, offset + run)` on `vdev` for the
    /// open TXG.
    ///
    /// # Panics
    ///
    /// The extent must be aligned to the vdev's ashift and lie within a
    /// single metaslab; violations are allocator bugs.
    pub fn alloc(&mut self, tx: &Tx, vdev: u32, offset: u64, run: u64) {
        let (vi, mi) = self.locate(tx, vdev, offset, run);
        self.vdevs[vi].metaslabs[mi]
            .staged_allocs
            .add(offset, offset + run);
    }

    /// Stages a free of `[offset, offset + run)` on `vdev` for the open
    /// TXG.
    ///
    /// # Panics
    ///
    /// Same contract as [`alloc`](Pool::alloc).
    pub fn free(&mut self, tx: &Tx, vdev: u32, offset: u64, run: u64) {
        let (vi, mi) = self.locate(tx, vdev, offset, run);
        self.vdevs[vi].metaslabs[mi]
            .staged_frees
            .add(offset, offset + run);
    }

    fn locate(&self, tx: &Tx, vdev: u32, offset: u64, run: u64) -> (usize, usize) {
        debug_assert_eq!(tx.txg(), self.txg, "staging outside the open TXG");
        let vd = self
            .vdevs
            .get(vdev as usize)
            .unwrap_or_else(|| panic!("no vdev {vdev}"));
        let unit = 1u64 << vd.ashift;
        assert!(
            offset % unit == 0 && run % unit == 0 && run > 0,
            "extent [{offset}, +{run}) not aligned to vdev {vdev}'s {unit}-byte unit"
        );
        let mi = (offset >> vd.ms_shift) as usize;
        assert!(mi < vd.metaslabs.len(), "offset {offset} past vdev {vdev}");
        assert!(
            offset + run <= (mi as u64 + 1) << vd.ms_shift,
            "extent [{offset}, +{run}) spans metaslabs"
        );
        (vdev as usize, mi)
    }

    // -------------------- accessors --------------------

    /// Total blocks across all log space maps.
    #[must_use]
    pub fn log_nblocks(&self) -> u64 {
        self.stats.nblocks
    }

    /// Bytes retained by unflushed change sets.
    #[must_use]
    pub fn log_memused(&self) -> u64 {
        self.stats.memused
    }

    /// Current log block limit.
    #[must_use]
    pub fn log_blocklimit(&self) -> u64 {
        self.stats.blocklimit
    }

    /// The log being appended for the current TXG, if one exists.
    #[must_use]
    pub fn syncing_log(&self) -> Option<&SpaceMap> {
        self.registry.syncing()
    }

    /// An immutable snapshot of the pool's log state.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            nblocks: self.stats.nblocks,
            memused: self.stats.memused,
            blocklimit: self.stats.blocklimit,
            space_allocated: self.space_allocated,
            txg: self.txg,
            log_count: self.registry.len(),
            flushed_metaslab_count: self.by_flushed.len(),
            summary_rows: self.summary.row_count(),
        }
    }

    /// TXGs of all live logs, oldest first.
    #[must_use]
    pub fn log_txgs(&self) -> Vec<u64> {
        self.registry.iter().map(|(txg, _)| txg).collect()
    }

    /// Block count of the log for `txg`, if registered.
    #[must_use]
    pub fn log_nblocks_of(&self, txg: u64) -> Option<u64> {
        self.registry.lookup(txg).map(|e| e.nblocks)
    }

    /// Metaslab reference count of the log for `txg`, if registered.
    #[must_use]
    pub fn log_mscount_of(&self, txg: u64) -> Option<u64> {
        self.registry.lookup(txg).map(|e| e.mscount)
    }

    /// Backing object id of the log for `txg`, if registered.
    #[must_use]
    pub fn log_object_of(&self, txg: u64) -> Option<u64> {
        self.registry.lookup(txg).map(|e| e.object)
    }

    /// The summary rows, oldest first.
    pub fn summary_rows(&self) -> impl Iterator<Item = &SummaryRow> {
        self.summary.rows()
    }

    /// A metaslab's unflushed `(allocs, frees)` sets.
    #[must_use]
    pub fn metaslab_unflushed(&self, vdev: u32, ms: u32) -> (&rangeset::RangeSet, &rangeset::RangeSet) {
        let m = &self.vdevs[vdev as usize].metaslabs[ms as usize];
        (&m.unflushed_allocs, &m.unflushed_frees)
    }

    /// A metaslab's flush watermark (0 = never logged).
    #[must_use]
    pub fn metaslab_unflushed_txg(&self, vdev: u32, ms: u32) -> u64 {
        self.vdevs[vdev as usize].metaslabs[ms as usize].unflushed_txg
    }

    /// Whether a metaslab has unflushed changes pending.
    #[must_use]
    pub fn metaslab_unflushed_dirty(&self, vdev: u32, ms: u32) -> bool {
        self.vdevs[vdev as usize].metaslabs[ms as usize].unflushed_dirty
    }

    /// A metaslab's net allocated bytes, unflushed changes included.
    #[must_use]
    pub fn metaslab_allocated(&self, vdev: u32, ms: u32) -> i64 {
        self.vdevs[vdev as usize].metaslabs[ms as usize].allocated
    }

    /// The backing object store (read-only).
    #[must_use]
    pub fn mos(&self) -> &Mos {
        &self.mos
    }

    /// Mutable access to the backing object store, for embedders that need
    /// to adjust store-level settings such as capacity.
    pub fn mos_mut(&mut self) -> &mut Mos {
        &mut self.mos
    }

    /// Checks that the registry, the summary, and the flush index agree on
    /// metaslab and block counts.
    ///
    /// # Panics
    ///
    /// Panics on any mismatch; these are the engine's core accounting
    /// invariants.
    pub fn verify_counts(&self) {
        let ms_in_index = self.by_flushed.len() as u64;
        let ms_in_summary = self.summary.mscount_total();
        let blk_in_summary = self.summary.blkcount_total();

        let mut ms_in_logs = 0;
        let mut blk_in_logs = 0;
        for (_, entry) in self.registry.iter() {
            ms_in_logs += entry.mscount;
            blk_in_logs += entry.nblocks;
        }

        assert_eq!(ms_in_logs, ms_in_summary);
        assert_eq!(ms_in_logs, ms_in_index);
        assert_eq!(blk_in_logs, blk_in_summary);
        assert_eq!(blk_in_logs, self.stats.nblocks);
    }
}

#[cfg(test)]
mod tests;

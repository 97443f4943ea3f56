//! Import: rebuild the pool's in-memory log state from the object store.
//!
//! The cold-start path reads the persisted geometry, the per-metaslab
//! watermarks, and the log ZAP, then replays every log space map in TXG
//! order into the metaslabs' unflushed sets. Records older than a
//! metaslab's watermark are already baked into its own space map and are
//! skipped. Any read or decode error is fatal: the partially-built state is
//! dropped and nothing of it survives.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use config::Tunables;
use mos::{Mos, MosError};
use rangeset::remove_xor_add_segment;
use spacemap::{SegmentKind, SpaceMap, SpaceMapReader};

use crate::metaslab::{Metaslab, Vdev};
use crate::registry::LogRegistry;
use crate::scheduler::blocklimit_for;
use crate::summary::LogSummary;
use crate::{
    layout, Pool, PoolError, UnflushedStats, DIR_KEY_LAST_TXG, DIR_KEY_LAYOUT,
    DIR_KEY_LOG_SPACEMAP_ZAP, VDEV_KEY_MS_ARRAY, VDEV_KEY_UNFLUSHED_TXGS,
};

/// At most this many log space maps are opened ahead of the replay cursor.
const PREFETCH_MAX_MAPS: usize = 16;

/// The window never shrinks below this many maps, whatever their size.
const PREFETCH_MIN_MAPS: usize = 2;

impl Pool {
    /// Loads a pool from an existing object store.
    pub fn load(mos: Mos, tunables: Tunables) -> Result<Self, PoolError> {
        Self::load_inner(mos, tunables, None)
    }

    /// Like [`load`](Pool::load), but aborts cleanly with
    /// [`PoolError::Shutdown`] if `shutdown` becomes true between log
    /// space maps.
    pub fn load_with_shutdown(
        mos: Mos,
        tunables: Tunables,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, PoolError> {
        Self::load_inner(mos, tunables, Some(shutdown))
    }

    fn load_inner(
        mos: Mos,
        tunables: Tunables,
        shutdown: Option<Arc<AtomicBool>>,
    ) -> Result<Self, PoolError> {
        let dir = mos.directory();

        let layout_obj = match mos.zap_lookup(dir, DIR_KEY_LAYOUT) {
            Ok(obj) => obj,
            Err(MosError::ZapKeyNotFound { .. }) => {
                return Err(PoolError::Corruption("pool has no layout record"))
            }
            Err(e) => return Err(e.into()),
        };
        let last_synced = match mos.zap_lookup(dir, DIR_KEY_LAST_TXG) {
            Ok(txg) => txg,
            Err(MosError::ZapKeyNotFound { .. }) => {
                return Err(PoolError::Corruption("pool has no last-synced txg"))
            }
            Err(e) => return Err(e.into()),
        };

        // Rebuild the vdev/metaslab model, opening per-metaslab space maps
        // where they exist.
        let mut vdevs = Vec::new();
        for (lay, top_zap) in layout::parse_layout(&mos.read_all(layout_obj)?)? {
            let ms_array_obj = mos.zap_lookup(top_zap, VDEV_KEY_MS_ARRAY)?;
            let unflushed_obj = mos.zap_lookup(top_zap, VDEV_KEY_UNFLUSHED_TXGS)?;

            let mut metaslabs = Vec::with_capacity(lay.ms_count as usize);
            for mi in 0..lay.ms_count as u64 {
                let mut ms = Metaslab::new();
                let sm_obj = read_u64_record(&mos, ms_array_obj, mi)?;
                if sm_obj != 0 {
                    ms.sm = Some(SpaceMap::open(&mos, sm_obj)?);
                }
                metaslabs.push(ms);
            }
            vdevs.push(Vdev {
                ashift: lay.ashift,
                ms_shift: lay.ms_shift,
                top_zap,
                ms_array_obj,
                unflushed_obj,
                metaslabs,
            });
        }

        // Watermarks: every metaslab with a nonzero unflushed TXG joins the
        // flush index.
        let mut by_flushed = BTreeSet::new();
        for (vi, vd) in vdevs.iter_mut().enumerate() {
            for mi in 0..vd.metaslabs.len() {
                let watermark = read_u64_record(&mos, vd.unflushed_obj, mi as u64)?;
                vd.metaslabs[mi].unflushed_txg = watermark;
                if watermark != 0 {
                    by_flushed.insert((watermark, vi as u32, mi as u32));
                }
            }
        }

        // The log registry, straight from the TXG-keyed ZAP.
        let mut registry = LogRegistry::default();
        let log_zap = match mos.zap_lookup(dir, DIR_KEY_LOG_SPACEMAP_ZAP) {
            Ok(zap) => {
                for (txg, object) in mos.zap_iter(zap)? {
                    registry.add(txg, object);
                }
                zap
            }
            Err(MosError::ZapKeyNotFound { .. }) => 0,
            Err(e) => return Err(e.into()),
        };

        // Every watermark must name a live log; anything else means the
        // pool lost a log it still needs.
        for &(watermark, vdev, ms) in &by_flushed {
            if !registry.mscount_inc_at(watermark) {
                log::error!(
                    "metaslab {vdev}/{ms}: unflushed txg {watermark} has no log space map"
                );
                return Err(PoolError::LogNotFound { txg: watermark });
            }
        }

        let mut summary = LogSummary::default();
        let mut stats = UnflushedStats::default();
        if log_zap != 0 {
            stats.blocklimit = blocklimit_for(&summary, &tunables);
        }
        let txgs_per_row = tunables.summary_txgs_per_row();

        // Replay the logs oldest-first, keeping a bounded prefetch window
        // of opened (and thereby read and checksum-verified) maps ahead of
        // the cursor.
        let log_objects: Vec<(u64, u64)> =
            registry.iter().map(|(txg, e)| (txg, e.object)).collect();
        let mut window: VecDeque<(u64, SpaceMapReader)> = VecDeque::new();
        let mut next_open = 0usize;
        let mut open_bytes = 0u64;
        let mut maps_read = 0usize;

        while maps_read < log_objects.len() {
            let want_open = next_open < log_objects.len()
                && window.len() < PREFETCH_MAX_MAPS
                && (window.len() < PREFETCH_MIN_MAPS
                    || open_bytes < 2 * tunables.prefetch_max_bytes);
            if want_open {
                let (txg, object) = log_objects[next_open];
                let reader = SpaceMapReader::open(&mos, object).inspect_err(|e| {
                    log::error!("failed to read log space map for txg {txg}: {e}");
                })?;
                open_bytes += reader.length();
                window.push_back((txg, reader));
                next_open += 1;
                continue;
            }

            let Some((txg, reader)) = window.pop_front() else {
                return Err(PoolError::Corruption("prefetch window drained early"));
            };
            if shutdown
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::Relaxed))
            {
                log::info!("shutdown requested, abandoning log replay");
                return Err(PoolError::Shutdown);
            }

            let nblocks = reader.nblocks();
            registry.set_nblocks(txg, nblocks);
            stats.nblocks += nblocks;
            let mscount = registry.lookup(txg).map_or(0, |e| e.mscount);
            let blocks_per_row = tunables.summary_blocks_per_row(stats.blocklimit);
            summary.add_data(txg, mscount, 0, nblocks, txgs_per_row, blocks_per_row);

            let mut stray: Option<(u32, u64)> = None;
            reader.iterate(txg, |entry| {
                let Some(vd) = vdevs.get_mut(entry.vdev as usize) else {
                    stray = Some((entry.vdev, entry.offset));
                    return;
                };
                let mi = (entry.offset >> vd.ms_shift) as usize;
                let Some(ms) = vd.metaslabs.get_mut(mi) else {
                    stray = Some((entry.vdev, entry.offset));
                    return;
                };

                // Already flushed into the metaslab's own space map.
                if entry.txg < ms.unflushed_txg {
                    return;
                }

                let (lo, hi) = (entry.offset, entry.offset + entry.run);
                match entry.kind {
                    SegmentKind::Alloc => {
                        remove_xor_add_segment(lo, hi, &mut ms.unflushed_frees, &mut ms.unflushed_allocs);
                    }
                    SegmentKind::Free => {
                        remove_xor_add_segment(lo, hi, &mut ms.unflushed_allocs, &mut ms.unflushed_frees);
                    }
                }
                if !ms.unflushed_dirty {
                    ms.unflushed_dirty = true;
                    summary.dirty_flushed_metaslab(ms.unflushed_txg);
                }
            })?;
            if let Some((vdev, offset)) = stray {
                log::error!("log for txg {txg}: record for unknown location {vdev}/{offset}");
                return Err(PoolError::Corruption("log record names an unknown vdev"));
            }

            open_bytes -= reader.length();
            maps_read += 1;
            stats.blocklimit = blocklimit_for(&summary, &tunables);
            log::debug!("replayed log space map for txg {txg} ({nblocks} blocks)");
        }

        if log_zap != 0 {
            log::info!(
                "read {} log space maps ({} total blocks)",
                log_objects.len(),
                stats.nblocks
            );
        }

        // With the unflushed sets rebuilt, recompute allocation and memory
        // accounting.
        let mut space_allocated = 0i64;
        let mut memused = 0u64;
        for vd in &mut vdevs {
            for ms in &mut vd.metaslabs {
                let flushed = ms.sm.as_ref().map_or(0, SpaceMap::allocated);
                ms.allocated = flushed + ms.unflushed_allocs.space() as i64
                    - ms.unflushed_frees.space() as i64;
                space_allocated += ms.allocated;
                memused += ms.memused();
            }
        }
        stats.memused = memused;

        let pool = Self {
            mos,
            tunables,
            vdevs,
            registry,
            summary,
            by_flushed,
            stats,
            txg: last_synced + 1,
            flushall_txg: 0,
            log_zap,
            space_allocated,
        };
        #[cfg(debug_assertions)]
        pool.verify_counts();
        Ok(pool)
    }
}

/// Reads the `index`-th fixed-size `u64` record of an object.
fn read_u64_record(mos: &Mos, object: u64, index: u64) -> Result<u64, PoolError> {
    let bytes = mos.read_at(object, index * 8, 8)?;
    Ok(u64::from_le_bytes(
        bytes.as_slice().try_into().expect("read_at returned 8 bytes"),
    ))
}

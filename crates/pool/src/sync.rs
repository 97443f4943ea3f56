//! The per-TXG sync pipeline.
//!
//! Order within one TXG:
//!
//! 1. [`flush_metaslabs`](Pool::flush_metaslabs) — consult the scheduler
//!    and drain the chosen metaslabs, oldest watermark first. Runs before
//!    any of this TXG's changes are logged, so a flushed metaslab's space
//!    map only ever holds entries from *before* its new watermark.
//! 2. [`sync_staged_changes`](Pool::sync_staged_changes) — append the open
//!    TXG's staged allocs/frees to the syncing log and fold them into the
//!    unflushed sets.
//! 3. [`close_syncing_log`](Pool::close_syncing_log) — freeze the log,
//!    account its blocks.
//! 4. [`cleanup_old_logs`](Pool::cleanup_old_logs) — destroy logs older
//!    than the oldest watermark (normally already done by the per-flush
//!    bumps; idempotent).
//!
//! [`txg_sync`](Pool::txg_sync) composes all of it and advances the TXG.

use std::ops::Bound::{Excluded, Unbounded};

use mos::Tx;
use rangeset::remove_xor_add_segment;
use spacemap::{SegmentKind, SpaceMap};

use crate::metaslab::Metaslab;
use crate::scheduler::{
    blocklimit_for, estimate_incoming_log_blocks, estimate_metaslabs_to_flush, exceeds_memlimit,
};
use crate::{Pool, PoolError, UnflushedStats, DIR_KEY_LAST_TXG, DIR_KEY_LOG_SPACEMAP_ZAP, LOG_SM_SHIFT, MS_SM_BLKSZ};

impl Pool {
    /// Runs the full sync pipeline for the open TXG and advances to the
    /// next one.
    pub fn txg_sync(&mut self, tx: Tx) -> Result<(), PoolError> {
        assert_eq!(tx.txg(), self.txg, "out-of-order txg sync");

        self.flush_metaslabs(&tx)?;
        self.sync_staged_changes(&tx)?;
        self.close_syncing_log(&tx)?;
        self.cleanup_old_logs(&tx)?;
        self.txg_advance(&tx)?;
        Ok(())
    }

    /// Flushes metaslabs for this TXG according to the memory and block
    /// heuristics (or everything, when an export requested it).
    pub fn flush_metaslabs(&mut self, tx: &Tx) -> Result<(), PoolError> {
        let txg = tx.txg();

        if self.by_flushed.is_empty() {
            return Ok(());
        }
        // An idle TXG must stay clean; only flush when this TXG is already
        // writing changes or an export wants everything out.
        if !self.any_staged_changes() && !self.flushall_requested() {
            return Ok(());
        }

        // The syncing log must exist before the first flush: bumps count
        // their metaslab against the current TXG's registry entry.
        self.generate_syncing_log(tx)?;

        let mut want_to_flush = if self.flushall_requested() {
            u64::MAX
        } else {
            let incoming = estimate_incoming_log_blocks(&self.registry, txg, &self.tunables);
            estimate_metaslabs_to_flush(&self.summary, &self.stats, &self.tunables, incoming)
        };

        // Flushing repositions the current metaslab within the index, so
        // walk by strictly-ascending key instead of holding an iterator.
        let mut cursor: Option<(u64, u32, u32)> = None;
        loop {
            let next = match cursor {
                None => self.by_flushed.iter().next().copied(),
                Some(c) => self
                    .by_flushed
                    .range((Excluded(c), Unbounded))
                    .next()
                    .copied(),
            };
            let Some(key) = next else { break };
            let (watermark, vdev, ms) = key;

            // Reaching a metaslab flushed this TXG means a full circle.
            if watermark == txg {
                break;
            }
            if want_to_flush == 0 && !exceeds_memlimit(&self.stats, &self.tunables) {
                break;
            }

            let (vi, mi) = (vdev as usize, ms as usize);
            if self.vdevs[vi].metaslabs[mi].unflushed_dirty {
                match self.metaslab_flush(vi, mi, tx) {
                    Ok(()) => {
                        if want_to_flush > 0 {
                            want_to_flush -= 1;
                        }
                    }
                    Err(e) => {
                        // The metaslab keeps its dirty state and is retried
                        // next TXG.
                        log::warn!("aborting flush at metaslab {vdev}/{ms}: {e}");
                        break;
                    }
                }
            } else {
                self.unflushed_bump(vi, mi, tx, false)?;
            }
            cursor = Some(key);
        }

        self.set_blocklimit();
        Ok(())
    }

    /// Appends this TXG's staged changes to the syncing log and folds them
    /// into the unflushed sets.
    pub fn sync_staged_changes(&mut self, tx: &Tx) -> Result<(), PoolError> {
        let txg = tx.txg();

        for vi in 0..self.vdevs.len() {
            for mi in 0..self.vdevs[vi].metaslabs.len() {
                if !self.vdevs[vi].metaslabs[mi].has_staged() {
                    continue;
                }
                self.generate_syncing_log(tx)?;

                // First logged sync for this metaslab: it enters the flush
                // index with the current TXG as its watermark, dirty since
                // its changes are about to land in the unflushed sets.
                if self.vdevs[vi].metaslabs[mi].unflushed_txg == 0 {
                    let (tpr, bpr) = self.summary_row_caps();
                    let unflushed_obj = self.vdevs[vi].unflushed_obj;
                    let ms = &mut self.vdevs[vi].metaslabs[mi];
                    ms.unflushed_txg = txg;
                    ms.unflushed_dirty = true;
                    self.by_flushed.insert((txg, vi as u32, mi as u32));
                    self.mos
                        .write_at(unflushed_obj, mi as u64 * 8, &txg.to_le_bytes(), tx)?;
                    if !self.registry.mscount_inc(txg) {
                        return Err(PoolError::Corruption(
                            "first-contact metaslab with no syncing log",
                        ));
                    }
                    self.summary.add_flushed_metaslab(txg, true, tpr, bpr);
                }

                let vdev_id = vi as u32;
                let Some(syncing) = self.registry.syncing_mut() else {
                    return Err(PoolError::Corruption("staged changes with no syncing log"));
                };
                let ms = &mut self.vdevs[vi].metaslabs[mi];
                syncing.append_set(&mut self.mos, tx, &ms.staged_allocs, SegmentKind::Alloc, vdev_id)?;
                syncing.append_set(&mut self.mos, tx, &ms.staged_frees, SegmentKind::Free, vdev_id)?;

                let mem_before = ms.memused();
                let delta = ms.staged_allocs.space() as i64 - ms.staged_frees.space() as i64;
                {
                    let Metaslab {
                        staged_allocs,
                        staged_frees,
                        unflushed_allocs,
                        unflushed_frees,
                        ..
                    } = &mut *ms;
                    // Allocs first, frees second: a free staged after an
                    // alloc of the same extent in this TXG must cancel it.
                    for (lo, hi) in staged_allocs.iter() {
                        remove_xor_add_segment(lo, hi, unflushed_frees, unflushed_allocs);
                    }
                    for (lo, hi) in staged_frees.iter() {
                        remove_xor_add_segment(lo, hi, unflushed_allocs, unflushed_frees);
                    }
                }
                ms.staged_allocs.clear();
                ms.staged_frees.clear();
                ms.allocated += delta;
                let mem_after = ms.memused();
                let watermark = ms.unflushed_txg;
                let newly_dirty = !ms.unflushed_dirty;
                ms.unflushed_dirty = true;

                self.stats.memused = self.stats.memused - mem_before + mem_after;
                self.space_allocated += delta;
                if newly_dirty {
                    self.summary.dirty_flushed_metaslab(watermark);
                }
            }
        }
        Ok(())
    }

    /// Ensures the current TXG has a syncing log: creates the log ZAP on
    /// first use, the log object, its registry entry, and the ZAP entry.
    pub fn generate_syncing_log(&mut self, tx: &Tx) -> Result<(), PoolError> {
        if self.registry.syncing().is_some() {
            return Ok(());
        }
        let txg = tx.txg();

        if self.log_zap == 0 {
            debug_assert!(self.registry.is_empty());
            let zap = self.mos.zap_create(tx)?;
            let dir = self.mos.directory();
            self.mos.zap_add(dir, DIR_KEY_LOG_SPACEMAP_ZAP, zap, tx)?;
            self.log_zap = zap;
        }

        debug_assert!(
            self.mos.zap_lookup(self.log_zap, txg).is_err(),
            "log for txg {txg} already on disk"
        );
        let sm = SpaceMap::create(&mut self.mos, self.tunables.log_sm_blksz, LOG_SM_SHIFT, tx)?;
        self.mos.zap_add(self.log_zap, txg, sm.object(), tx)?;
        self.registry.add(txg, sm.object());
        self.registry.set_syncing(sm);

        self.set_blocklimit();
        Ok(())
    }

    /// Closes the syncing log: computes its block count, accounts it in the
    /// registry, the pool stats, and the summary tail.
    pub fn close_syncing_log(&mut self, tx: &Tx) -> Result<(), PoolError> {
        let Some(sm) = self.registry.take_syncing() else {
            return Ok(());
        };
        let txg = tx.txg();
        debug_assert_eq!(
            self.registry.newest().map(|(t, _)| t),
            Some(txg),
            "syncing log is not the newest registry entry"
        );

        let nblocks = sm.close(&mut self.mos, tx)?;
        self.registry.set_nblocks(txg, nblocks);
        self.stats.nblocks += nblocks;
        let (tpr, bpr) = self.summary_row_caps();
        self.summary.add_incoming_blocks(txg, nblocks, tpr, bpr);

        #[cfg(debug_assertions)]
        self.verify_counts();

        // The export flush ran to completion; let the remaining TXGs before
        // the pool closes stay clean.
        if self.flushall_requested() {
            self.flushall_txg = 0;
        }
        Ok(())
    }

    /// Destroys logs that no metaslab watermark references any more.
    pub fn cleanup_old_logs(&mut self, tx: &Tx) -> Result<(), PoolError> {
        if self.log_zap == 0 {
            debug_assert!(self.registry.is_empty());
            return Ok(());
        }
        let Some(&(oldest_watermark, _, _)) = self.by_flushed.iter().next() else {
            return Ok(());
        };

        while let Some((txg, _)) = self.registry.oldest() {
            if txg >= oldest_watermark {
                break;
            }
            let (txg, entry) = self
                .registry
                .remove_oldest()
                .map_err(|(txg, mscount)| PoolError::Busy { txg, mscount })?;
            SpaceMap::destroy(&mut self.mos, entry.object, tx)?;
            self.mos.zap_remove(self.log_zap, txg, tx)?;
            if !self.summary.decrement_blocks(entry.nblocks) {
                return Err(PoolError::Corruption(
                    "summary holds fewer blocks than the destroyed log",
                ));
            }
            self.stats.nblocks -= entry.nblocks;
        }
        Ok(())
    }

    /// Persists the synced TXG and opens the next one.
    pub fn txg_advance(&mut self, tx: &Tx) -> Result<(), PoolError> {
        let dir = self.mos.directory();
        self.mos.zap_update(dir, DIR_KEY_LAST_TXG, tx.txg(), tx)?;
        self.txg = tx.txg() + 1;
        Ok(())
    }

    /// Asks the next sync to flush every metaslab (the export path).
    pub fn request_flush_all(&mut self) {
        self.flushall_txg = self.txg;
    }

    /// Whether a flush-everything request is pending.
    #[must_use]
    pub fn flushall_requested(&self) -> bool {
        self.flushall_txg != 0
    }

    /// Exports the pool: flushes every metaslab in one final sync (unless
    /// the crash-simulation knob is set), then unloads all in-memory log
    /// state. Obsolete log objects are destroyed by the final sync; the
    /// persisted watermarks stay consistent for a future import.
    pub fn export(&mut self) -> Result<(), PoolError> {
        if !self.tunables.keep_log_spacemaps_at_export && !self.by_flushed.is_empty() {
            self.request_flush_all();
            let tx = self.txg_begin();
            self.txg_sync(tx)?;
        }
        self.unload();
        Ok(())
    }

    /// Recomputes the log block limit from the summary's dirty metaslab
    /// count, clamped to the configured bounds. Zero until the first log
    /// exists.
    pub(crate) fn set_blocklimit(&mut self) {
        if self.log_zap == 0 {
            debug_assert_eq!(self.stats.blocklimit, 0);
            return;
        }
        self.stats.blocklimit = blocklimit_for(&self.summary, &self.tunables);
    }

    pub(crate) fn summary_row_caps(&self) -> (u64, u64) {
        (
            self.tunables.summary_txgs_per_row(),
            self.tunables.summary_blocks_per_row(self.stats.blocklimit),
        )
    }

    fn any_staged_changes(&self) -> bool {
        self.vdevs
            .iter()
            .any(|vd| vd.metaslabs.iter().any(Metaslab::has_staged))
    }

    /// Drains a dirty metaslab's unflushed sets into its own space map and
    /// repositions its watermark to this TXG.
    fn metaslab_flush(&mut self, vi: usize, mi: usize, tx: &Tx) -> Result<(), PoolError> {
        let txg = tx.txg();
        debug_assert!(self.vdevs[vi].metaslabs[mi].unflushed_dirty);

        let has_changes = {
            let ms = &self.vdevs[vi].metaslabs[mi];
            !ms.unflushed_allocs.is_empty() || !ms.unflushed_frees.is_empty()
        };
        if has_changes {
            self.ensure_metaslab_sm(vi, mi, tx)?;

            let vdev_id = vi as u32;
            let ms = &mut self.vdevs[vi].metaslabs[mi];
            let prev_watermark = ms.unflushed_txg;
            let Metaslab {
                sm: Some(sm),
                unflushed_allocs,
                unflushed_frees,
                ..
            } = &mut *ms
            else {
                return Err(PoolError::Corruption("flushing metaslab has no space map"));
            };

            // Annotate the watermark gap since the map's previous records so
            // the stream stays TXG-addressable end to end.
            if sm.length() > 0 && txg > prev_watermark {
                sm.append_skip(&mut self.mos, tx, txg - prev_watermark)?;
            }
            sm.append_set(&mut self.mos, tx, unflushed_allocs, SegmentKind::Alloc, vdev_id)?;
            sm.append_set(&mut self.mos, tx, unflushed_frees, SegmentKind::Free, vdev_id)?;

            let mem = unflushed_allocs.memused() + unflushed_frees.memused();
            unflushed_allocs.clear();
            unflushed_frees.clear();
            self.stats.memused -= mem;
        }

        self.unflushed_bump(vi, mi, tx, false)
    }

    /// Repositions a metaslab's watermark to the current TXG, moving its
    /// registry and summary accounting from the old TXG to the new one and
    /// retiring logs that became obsolete.
    fn unflushed_bump(&mut self, vi: usize, mi: usize, tx: &Tx, dirty: bool) -> Result<(), PoolError> {
        let txg = tx.txg();
        let (vdev_id, ms_id) = (vi as u32, mi as u32);

        let ms = &mut self.vdevs[vi].metaslabs[mi];
        let prev_txg = ms.unflushed_txg;
        let prev_dirty = ms.unflushed_dirty;
        ms.unflushed_txg = txg;
        ms.unflushed_dirty = dirty;
        let unflushed_obj = self.vdevs[vi].unflushed_obj;

        let removed = self.by_flushed.remove(&(prev_txg, vdev_id, ms_id));
        debug_assert!(removed, "bumped metaslab missing from the flush index");
        self.by_flushed.insert((txg, vdev_id, ms_id));
        self.mos
            .write_at(unflushed_obj, mi as u64 * 8, &txg.to_le_bytes(), tx)?;

        if !self.registry.mscount_dec(prev_txg) {
            return Err(PoolError::Corruption("bump from an unregistered log txg"));
        }
        if !self.registry.mscount_inc(txg) {
            return Err(PoolError::Corruption("bump without a syncing log"));
        }
        if !self.summary.decrement_mscount(prev_txg, prev_dirty) {
            return Err(PoolError::Corruption("bump from an unsummarized txg"));
        }
        let (tpr, bpr) = self.summary_row_caps();
        self.summary.add_flushed_metaslab(txg, dirty, tpr, bpr);

        self.cleanup_old_logs(tx)
    }

    /// Creates the metaslab's own space map on first use and records its
    /// object id in the vdev's metaslab array.
    fn ensure_metaslab_sm(&mut self, vi: usize, mi: usize, tx: &Tx) -> Result<(), PoolError> {
        if self.vdevs[vi].metaslabs[mi].sm.is_some() {
            return Ok(());
        }
        let ashift = self.vdevs[vi].ashift;
        let sm = SpaceMap::create(&mut self.mos, MS_SM_BLKSZ, ashift, tx)?;
        let ms_array_obj = self.vdevs[vi].ms_array_obj;
        self.mos
            .write_at(ms_array_obj, mi as u64 * 8, &sm.object().to_le_bytes(), tx)?;
        self.vdevs[vi].metaslabs[mi].sm = Some(sm);
        Ok(())
    }

    /// Tears down all in-memory log state. Objects on disk are untouched.
    fn unload(&mut self) {
        for vi in 0..self.vdevs.len() {
            for mi in 0..self.vdevs[vi].metaslabs.len() {
                let ms = &mut self.vdevs[vi].metaslabs[mi];
                if ms.unflushed_txg == 0 {
                    continue;
                }
                let (watermark, was_dirty) = (ms.unflushed_txg, ms.unflushed_dirty);
                ms.unflushed_txg = 0;
                ms.unflushed_dirty = false;
                ms.unflushed_allocs.clear();
                ms.unflushed_frees.clear();
                self.by_flushed.remove(&(watermark, vi as u32, mi as u32));
                // Registry or summary rows may already be gone when tearing
                // down a load that failed partway; that is fine here.
                self.registry.mscount_dec(watermark);
                self.summary.decrement_mscount(watermark, was_dirty);
            }
        }
        self.by_flushed.clear();
        self.registry.clear();
        self.summary.clear();
        self.stats = UnflushedStats::default();
        self.flushall_txg = 0;
        log::info!("unloaded log space map state");
    }
}

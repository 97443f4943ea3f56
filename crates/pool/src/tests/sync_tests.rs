use super::helpers::*;
use config::Tunables;
use spacemap::{SegmentKind, SpaceMapReader};

const KB: u64 = 1024;

// -------------------- First sync --------------------

#[test]
fn first_sync_logs_one_record() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = new_pool(&dir, 4, 100, Tunables::default());

    let tx = pool.txg_begin();
    pool.alloc(&tx, 0, 0, 8 * KB);
    pool.txg_sync(tx).unwrap();

    // Registry: exactly the log for TXG 100, one block long.
    assert_eq!(pool.log_txgs(), vec![100]);
    assert_eq!(pool.log_nblocks_of(100), Some(1));
    assert_eq!(pool.log_nblocks(), 1);
    assert_eq!(pool.log_mscount_of(100), Some(1));

    // Summary: one row covering TXG 100 with one dirty metaslab and one
    // block.
    let rows: Vec<_> = pool.summary_rows().cloned().collect();
    assert_eq!(rows.len(), 1);
    assert_eq!((rows[0].start, rows[0].end), (100, 100));
    assert_eq!(rows[0].mscount, 1);
    assert_eq!(rows[0].msdcount, 1);
    assert_eq!(rows[0].blkcount, 1);

    // The log itself holds exactly one ALLOC record for the extent.
    let object = pool.log_object_of(100).unwrap();
    let reader = SpaceMapReader::open(pool.mos(), object).unwrap();
    let mut entries = Vec::new();
    reader.iterate(100, |e| entries.push(*e)).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, SegmentKind::Alloc);
    assert_eq!(entries[0].vdev, 0);
    assert_eq!(entries[0].offset, 0);
    assert_eq!(entries[0].run, 8 * KB);
    assert_eq!(entries[0].txg, 100);

    pool.verify_counts();
}

#[test]
fn idle_txg_creates_no_log() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = new_pool(&dir, 4, 100, Tunables::default());

    let tx = pool.txg_begin();
    pool.txg_sync(tx).unwrap();

    assert!(pool.log_txgs().is_empty());
    assert_eq!(pool.stats().txg, 101);
}

// -------------------- Staged-change application --------------------

#[test]
fn alloc_then_free_each_txg_nets_to_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = new_pool(&dir, 4, 100, Tunables::default());

    for txg in 100..=103u64 {
        let tx = pool.txg_begin();
        pool.alloc(&tx, 0, 16 * KB, 4 * KB);
        pool.free(&tx, 0, 16 * KB, 4 * KB);
        drop(tx);
        sync_without_flush(&mut pool);

        let (allocs, frees) = pool.metaslab_unflushed(0, 0);
        assert!(allocs.is_empty(), "txg {txg}: allocs should cancel");
        assert!(frees.is_empty(), "txg {txg}: frees should cancel");
    }

    // Nothing was drained, so every log remains, each with both records.
    assert_eq!(pool.log_txgs(), vec![100, 101, 102, 103]);
    let mut total = 0;
    for txg in 100..=103 {
        let n = pool.log_nblocks_of(txg).unwrap();
        assert!(n >= 1);
        total += n;
    }
    assert_eq!(pool.log_nblocks(), total);
    assert_eq!(pool.metaslab_unflushed_txg(0, 0), 100);
    assert!(pool.metaslab_unflushed_dirty(0, 0));
    pool.verify_counts();
}

#[test]
fn staged_free_cancels_overlap_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = new_pool(&dir, 4, 100, Tunables::default());

    let tx = pool.txg_begin();
    pool.alloc(&tx, 0, 0, 8 * KB);
    drop(tx);
    sync_without_flush(&mut pool);

    let tx = pool.txg_begin();
    pool.free(&tx, 0, 4 * KB, 4 * KB);
    drop(tx);
    sync_without_flush(&mut pool);

    let (allocs, frees) = pool.metaslab_unflushed(0, 0);
    assert!(allocs.contains(0, 4 * KB));
    assert_eq!(allocs.space(), 4 * KB);
    assert!(frees.is_empty());
    assert_eq!(pool.metaslab_allocated(0, 0), 4 * KB as i64);
}

#[test]
fn allocated_space_tracks_net_changes() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = new_pool(&dir, 4, 100, Tunables::default());

    let tx = pool.txg_begin();
    pool.alloc(&tx, 0, 0, 8 * KB);
    pool.alloc(&tx, 0, 1 << MS_SHIFT, 16 * KB); // second metaslab
    pool.txg_sync(tx).unwrap();

    assert_eq!(pool.metaslab_allocated(0, 0), (8 * KB) as i64);
    assert_eq!(pool.metaslab_allocated(0, 1), (16 * KB) as i64);
    assert_eq!(pool.stats().space_allocated, (24 * KB) as i64);

    let tx = pool.txg_begin();
    pool.free(&tx, 0, 0, 8 * KB);
    pool.txg_sync(tx).unwrap();
    assert_eq!(pool.stats().space_allocated, (16 * KB) as i64);
}

// -------------------- Flushing --------------------

#[test]
fn flush_drains_into_metaslab_spacemap_and_retires_logs() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = new_pool(&dir, 4, 100, Tunables::default());

    let tx = pool.txg_begin();
    pool.alloc(&tx, 0, 0, 8 * KB);
    pool.txg_sync(tx).unwrap();
    let log_100 = pool.log_object_of(100).unwrap();

    // TXG 101 stages more work, so the scheduler runs and flushes the
    // metaslab (floor of one per dirty TXG).
    let tx = pool.txg_begin();
    pool.alloc(&tx, 0, 32 * KB, 4 * KB);
    pool.txg_sync(tx).unwrap();

    // The drain moved TXG 100's extent into the metaslab's own space map
    // and made the old log obsolete.
    assert_eq!(pool.metaslab_unflushed_txg(0, 0), 101);
    assert_eq!(pool.log_txgs(), vec![101]);
    assert!(!pool.mos().object_exists(log_100));

    let (allocs, frees) = pool.metaslab_unflushed(0, 0);
    assert!(allocs.contains(32 * KB, 36 * KB));
    assert_eq!(allocs.space(), 4 * KB);
    assert!(frees.is_empty());

    // Net allocation is unchanged by the move.
    assert_eq!(pool.metaslab_allocated(0, 0), (12 * KB) as i64);
    pool.verify_counts();
}

#[test]
fn clean_metaslabs_bump_without_draining() {
    let dir = tempfile::tempdir().unwrap();
    let mut tun = Tunables::default();
    tun.min_metaslabs_to_flush = 10;
    let mut pool = new_pool(&dir, 4, 100, tun);

    // Two metaslabs dirty in TXG 100; TXG 101 drains both (floor 10).
    let tx = pool.txg_begin();
    pool.alloc(&tx, 0, 0, 8 * KB);
    pool.alloc(&tx, 0, 1 << MS_SHIFT, 8 * KB);
    pool.txg_sync(tx).unwrap();

    let tx = pool.txg_begin();
    pool.alloc(&tx, 0, 64 * KB, 4 * KB);
    pool.txg_sync(tx).unwrap();
    assert_eq!(pool.metaslab_unflushed_txg(0, 0), 101);
    assert_eq!(pool.metaslab_unflushed_txg(0, 1), 101);
    assert!(!pool.metaslab_unflushed_dirty(0, 1));

    // TXG 102: metaslab 1 is clean, so it repositions without touching its
    // space map.
    let sm_len_before = {
        let obj = ms_spacemap_object(&pool, 1);
        SpaceMapReader::open(pool.mos(), obj).unwrap().length()
    };

    let tx = pool.txg_begin();
    pool.alloc(&tx, 0, 96 * KB, 4 * KB);
    pool.txg_sync(tx).unwrap();

    assert_eq!(pool.metaslab_unflushed_txg(0, 1), 102);
    assert!(!pool.metaslab_unflushed_dirty(0, 1));
    let sm_len_after = {
        let obj = ms_spacemap_object(&pool, 1);
        SpaceMapReader::open(pool.mos(), obj).unwrap().length()
    };
    assert_eq!(sm_len_before, sm_len_after);

    // All watermarks moved past TXGs 100 and 101, so both logs are gone.
    assert_eq!(pool.log_txgs(), vec![102]);
    assert_eq!(pool.log_mscount_of(102), Some(2));
    pool.verify_counts();
}

#[test]
fn memory_pressure_flushes_past_the_block_plan() {
    let dir = tempfile::tempdir().unwrap();
    let mut tun = Tunables::default();
    tun.min_metaslabs_to_flush = 0;
    tun.max_mem_amt = 0; // everything is over budget
    let mut pool = new_pool(&dir, 4, 100, tun);

    let tx = pool.txg_begin();
    for ms in 0..3u64 {
        pool.alloc(&tx, 0, ms << MS_SHIFT, 8 * KB);
    }
    pool.txg_sync(tx).unwrap();

    let tx = pool.txg_begin();
    pool.alloc(&tx, 0, 128 * KB, 4 * KB);
    pool.txg_sync(tx).unwrap();

    // Every dirty metaslab was drained, not just the planned count.
    for ms in 0..3u32 {
        assert_eq!(pool.metaslab_unflushed_txg(0, ms), 101, "metaslab {ms}");
    }
    pool.verify_counts();
}

#[test]
fn block_plan_alone_flushes_only_the_estimate() {
    let dir = tempfile::tempdir().unwrap();
    let mut tun = Tunables::default();
    tun.min_metaslabs_to_flush = 0;
    let mut pool = new_pool(&dir, 4, 100, tun);

    let tx = pool.txg_begin();
    for ms in 0..3u64 {
        pool.alloc(&tx, 0, ms << MS_SHIFT, 8 * KB);
    }
    pool.txg_sync(tx).unwrap();

    let tx = pool.txg_begin();
    pool.alloc(&tx, 0, 128 * KB, 4 * KB);
    pool.txg_sync(tx).unwrap();

    // Far under the block limit: the projection asks for one flush per
    // TXG, so exactly one metaslab moved.
    let moved = (0..3u32)
        .filter(|&ms| pool.metaslab_unflushed_txg(0, ms) == 101)
        .count();
    assert_eq!(moved, 1);
    pool.verify_counts();
}

// -------------------- Drain failure --------------------

#[test]
fn failed_drain_leaves_the_metaslab_dirty() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = new_pool(&dir, 4, 100, Tunables::default());

    let tx = pool.txg_begin();
    pool.alloc(&tx, 0, 0, 8 * KB);
    pool.txg_sync(tx).unwrap();

    // TXG 101: stage work on another metaslab, then leave just enough
    // capacity for the syncing log's ZAP entry but not for the drain's
    // record append.
    let tx = pool.txg_begin();
    pool.alloc(&tx, 0, 1 << MS_SHIFT, 4 * KB);
    let used = pool.mos().used_bytes();
    pool.mos_mut().set_capacity(Some(used + 16 + 7));

    pool.flush_metaslabs(&tx).unwrap();

    // The drain aborted; nothing moved and the metaslab retries next TXG.
    assert_eq!(pool.metaslab_unflushed_txg(0, 0), 100);
    assert!(pool.metaslab_unflushed_dirty(0, 0));
    let (allocs, _) = pool.metaslab_unflushed(0, 0);
    assert_eq!(allocs.space(), 8 * KB);

    // With space back, the same TXG's flush drains it.
    pool.mos_mut().set_capacity(None);
    pool.flush_metaslabs(&tx).unwrap();
    assert_eq!(pool.metaslab_unflushed_txg(0, 0), 101);

    pool.sync_staged_changes(&tx).unwrap();
    pool.close_syncing_log(&tx).unwrap();
    pool.cleanup_old_logs(&tx).unwrap();
    pool.txg_advance(&tx).unwrap();
    pool.verify_counts();
}

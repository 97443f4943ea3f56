use super::helpers::*;
use anyhow::Result;
use config::Tunables;
use mos::Mos;
use spacemap::SpaceMapReader;

use crate::Pool;

const KB: u64 = 1024;

/// Five dirty metaslabs spread over three logs: metaslabs 0-1 dirty since
/// TXG 100, 2-3 since 101, 4 since 102.
fn build_dirty_pool(dir: &tempfile::TempDir, tunables: Tunables) -> Pool {
    let mut pool = new_pool(dir, 8, 100, tunables);

    let assignments: [&[u64]; 3] = [&[0, 1], &[2, 3], &[4]];
    for metaslabs in assignments {
        let tx = pool.txg_begin();
        for &ms in metaslabs {
            pool.alloc(&tx, 0, ms << MS_SHIFT, 8 * KB);
        }
        drop(tx);
        sync_without_flush(&mut pool);
    }

    assert_eq!(pool.log_txgs(), vec![100, 101, 102]);
    pool
}

// -------------------- Export --------------------

#[test]
fn export_drains_everything_and_empties_the_log() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut pool = build_dirty_pool(&dir, Tunables::default());
    let old_logs: Vec<u64> = (100..=102)
        .map(|txg| pool.log_object_of(txg).unwrap())
        .collect();

    pool.export()?;

    // Every metaslab was drained into its own space map.
    for ms in 0..5u32 {
        let sm_obj = ms_spacemap_object(&pool, ms);
        assert_ne!(sm_obj, 0, "metaslab {ms} never got a space map");
        let reader = SpaceMapReader::open(pool.mos(), sm_obj)?;
        assert_eq!(reader.allocated(), (8 * KB) as i64, "metaslab {ms}");
    }

    // All three old logs are gone, on disk and in memory.
    for obj in old_logs {
        assert!(!pool.mos().object_exists(obj));
    }
    let stats = pool.stats();
    assert_eq!(stats.log_count, 0);
    assert_eq!(stats.summary_rows, 0);
    assert_eq!(stats.nblocks, 0);
    assert_eq!(stats.memused, 0);
    assert_eq!(stats.flushed_metaslab_count, 0);
    Ok(())
}

#[test]
fn exported_pool_reimports_clean() -> Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let mut pool = build_dirty_pool(&dir, Tunables::default());
        pool.export()?;
    }

    let mut pool = Pool::load(Mos::open(dir.path())?, Tunables::default())?;
    for ms in 0..5u32 {
        let (allocs, frees) = pool.metaslab_unflushed(0, ms);
        assert!(allocs.is_empty());
        assert!(frees.is_empty());
        assert!(!pool.metaslab_unflushed_dirty(0, ms));
        // Everyone's watermark points at the export TXG.
        assert_eq!(pool.metaslab_unflushed_txg(0, ms), 103);
    }
    assert_eq!(pool.metaslab_allocated(0, 0), (8 * KB) as i64);
    pool.verify_counts();

    // The pool keeps working after reimport.
    let tx = pool.txg_begin();
    pool.alloc(&tx, 0, 128 * KB, 4 * KB);
    pool.txg_sync(tx)?;
    pool.verify_counts();
    Ok(())
}

#[test]
fn keep_knob_simulates_a_crash() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut tun = Tunables::default();
    tun.keep_log_spacemaps_at_export = true;
    {
        let mut pool = build_dirty_pool(&dir, tun.clone());
        pool.export()?;

        // In-memory state is unloaded, but the logs survived on disk.
        assert_eq!(pool.stats().log_count, 0);
    }

    let pool = Pool::load(Mos::open(dir.path())?, Tunables::default())?;
    assert_eq!(pool.log_txgs(), vec![100, 101, 102]);
    for (ms, txg) in [(0u32, 100u64), (1, 100), (2, 101), (3, 101), (4, 102)] {
        assert_eq!(pool.metaslab_unflushed_txg(0, ms), txg, "metaslab {ms}");
        assert!(pool.metaslab_unflushed_dirty(0, ms));
        let (allocs, _) = pool.metaslab_unflushed(0, ms);
        assert_eq!(allocs.space(), 8 * KB);
    }
    pool.verify_counts();
    Ok(())
}

#[test]
fn flush_all_request_clears_after_the_sync() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut pool = build_dirty_pool(&dir, Tunables::default());

    pool.request_flush_all();
    assert!(pool.flushall_requested());

    let tx = pool.txg_begin();
    pool.txg_sync(tx)?;
    assert!(!pool.flushall_requested());

    // Everything moved to the flush-all TXG in one go.
    for ms in 0..5u32 {
        assert_eq!(pool.metaslab_unflushed_txg(0, ms), 103);
    }
    assert_eq!(pool.log_txgs(), vec![103]);
    pool.verify_counts();
    Ok(())
}

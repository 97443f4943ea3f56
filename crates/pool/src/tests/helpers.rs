use config::Tunables;
use mos::Mos;
use tempfile::TempDir;

use crate::{Pool, VdevLayout};

/// 512-byte allocation units.
pub const ASHIFT: u32 = 9;

/// 4 MiB metaslabs.
pub const MS_SHIFT: u32 = 22;

pub fn single_vdev(ms_count: u32) -> Vec<VdevLayout> {
    vec![VdevLayout {
        ashift: ASHIFT,
        ms_shift: MS_SHIFT,
        ms_count,
    }]
}

pub fn new_pool(dir: &TempDir, ms_count: u32, initial_txg: u64, tunables: Tunables) -> Pool {
    let mos = Mos::create(dir.path()).unwrap();
    Pool::create(mos, &single_vdev(ms_count), initial_txg, tunables).unwrap()
}

/// Syncs the open TXG while bypassing the flush scheduler, so tests can
/// accumulate logs without the heuristics draining metaslabs underneath
/// them.
pub fn sync_without_flush(pool: &mut Pool) {
    let tx = pool.txg_begin();
    pool.sync_staged_changes(&tx).unwrap();
    pool.close_syncing_log(&tx).unwrap();
    pool.cleanup_old_logs(&tx).unwrap();
    pool.txg_advance(&tx).unwrap();
}

/// Digs a metaslab's space map object id out of the persisted layout
/// (single-vdev pools only).
pub fn ms_spacemap_object(pool: &Pool, ms: u32) -> u64 {
    let layout_obj = pool
        .mos()
        .zap_lookup(pool.mos().directory(), crate::DIR_KEY_LAYOUT)
        .unwrap();
    let bytes = pool.mos().read_all(layout_obj).unwrap();
    // The vdev's top ZAP id sits at offset 20 of the single-vdev record.
    let top_zap = u64::from_le_bytes(bytes[20..28].try_into().unwrap());
    let ms_array = pool
        .mos()
        .zap_lookup(top_zap, crate::VDEV_KEY_MS_ARRAY)
        .unwrap();
    let bytes = pool.mos().read_at(ms_array, u64::from(ms) * 8, 8).unwrap();
    u64::from_le_bytes(bytes.try_into().unwrap())
}

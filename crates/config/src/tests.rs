use super::*;

#[test]
fn defaults_match_tuned_constants() {
    let tun = Tunables::default();
    assert_eq!(tun.max_mem_amt, 1 << 30);
    assert_eq!(tun.max_mem_ppm, 1000);
    assert_eq!(tun.log_block_pct, 400);
    assert_eq!(tun.log_block_min, 1000);
    assert_eq!(tun.log_block_max, 1 << 17);
    assert_eq!(tun.log_txg_max, 1000);
    assert_eq!(tun.max_summary_rows, 10);
    assert_eq!(tun.max_log_walking, 5);
    assert_eq!(tun.min_metaslabs_to_flush, 1);
    assert_eq!(tun.log_sm_blksz, 128 * 1024);
    assert!(!tun.keep_log_spacemaps_at_export);
}

#[test]
fn mem_budget_takes_the_smaller_cap() {
    let mut tun = Tunables::default();

    // 16 GiB at 1000 ppm -> ~17 MB soft cap, well under the 1 GiB hard cap.
    assert_eq!(tun.mem_budget(), (16u64 << 30) * 1000 / 1_000_000);

    // Raise the ppm share past the hard cap; the hard cap wins.
    tun.max_mem_ppm = 1_000_000;
    assert_eq!(tun.mem_budget(), 1 << 30);
}

#[test]
fn summary_row_capacity() {
    let tun = Tunables::default();
    assert_eq!(tun.summary_txgs_per_row(), 100);
    assert_eq!(tun.summary_blocks_per_row(1000), 100);
    // A zero block limit still yields a nonzero row capacity.
    assert_eq!(tun.summary_blocks_per_row(0), 1);
    // Non-divisible limits round up.
    assert_eq!(tun.summary_blocks_per_row(1001), 101);
}

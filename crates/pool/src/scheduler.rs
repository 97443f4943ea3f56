//! The flush scheduler: decides how many metaslabs to flush in a TXG.
//!
//! Two orthogonal heuristics feed the decision:
//!
//! - **Memory** — unflushed change sets are capped by a memory budget;
//!   crossing it forces flushing regardless of the block plan.
//! - **Blocks** — the log must stay under its block limit. The incoming
//!   block rate of recent TXGs is projected forward across the summary to
//!   find, for several points in the future, how many flushes per TXG keep
//!   the log under the limit; the plan takes the maximum of those estimates.

use config::Tunables;

use crate::registry::LogRegistry;
use crate::summary::LogSummary;
use crate::UnflushedStats;

/// The block limit implied by the summary's dirty metaslab count: a
/// percentage of the metaslabs that will eventually need a flush, clamped
/// to the configured bounds.
pub(crate) fn blocklimit_for(summary: &LogSummary, tunables: &Tunables) -> u64 {
    let limit = summary.msdcount_total() * tunables.log_block_pct / 100;
    limit
        .max(tunables.log_block_min)
        .min(tunables.log_block_max)
}

/// Estimates the block count the syncing log will add this TXG by averaging
/// the most recent closed logs.
///
/// The log being written for `syncing_txg` is skipped: its running length
/// would drag the average down and make the estimate optimistic.
pub(crate) fn estimate_incoming_log_blocks(
    registry: &LogRegistry,
    syncing_txg: u64,
    tunables: &Tunables,
) -> u64 {
    let mut steps = 0u64;
    let mut sum = 0u64;
    for (txg, entry) in registry.iter().rev() {
        if steps >= tunables.max_log_walking {
            break;
        }
        if txg == syncing_txg {
            continue;
        }
        sum += entry.nblocks;
        steps += 1;
    }
    if steps > 0 {
        sum.div_ceil(steps)
    } else {
        0
    }
}

/// Whether unflushed changes exceed the memory budget.
pub(crate) fn exceeds_memlimit(stats: &UnflushedStats, tunables: &Tunables) -> bool {
    stats.memused > tunables.mem_budget()
}

/// Estimates how many metaslabs to flush per TXG to satisfy the block
/// heuristic.
///
/// Walks the summary from oldest to newest, projecting the incoming rate
/// into the future. While block and TXG credit remain, whole TXGs are
/// skipped; once a credit runs out, the current row's blocks and TXGs are
/// handed back as credit and its dirty metaslabs join the required flushes.
/// The running maximum of `flushes_needed / txgs_in_future` over all rows is
/// the per-TXG plan, floored at `min_metaslabs_to_flush`.
pub(crate) fn estimate_metaslabs_to_flush(
    summary: &LogSummary,
    stats: &UnflushedStats,
    tunables: &Tunables,
    incoming: u64,
) -> u64 {
    debug_assert!(stats.blocklimit != 0, "block heuristic with no block limit");

    // How many TXGs ahead the projection currently stands; starts at 1
    // because the incoming rate is already charged for the first one.
    let mut txgs_in_future: u64 = 1;

    let mut available_blocks =
        stats.blocklimit as i64 - stats.nblocks as i64 - incoming as i64;
    let mut available_txgs = tunables.log_txg_max as i64 - summary.txgcount_total() as i64;

    let mut total_flushes: u64 = 0;
    let mut max_flushes_per_txg = tunables.min_metaslabs_to_flush;

    for row in summary.rows() {
        // While there is room under both limits, skip ahead full TXGs at
        // the incoming rate until one of them is exceeded.
        if available_blocks >= 0 && available_txgs >= 0 {
            let skip_txgs = if incoming == 0 {
                available_txgs as u64 + 1
            } else {
                (available_txgs as u64 + 1).min(available_blocks as u64 / incoming + 1)
            };
            available_blocks -= (skip_txgs * incoming) as i64;
            available_txgs -= skip_txgs as i64;
            txgs_in_future += skip_txgs;
            debug_assert!(available_blocks >= -(incoming as i64));
            debug_assert!(available_txgs >= -1);
        }

        // The limit was just exceeded this far into the future; flushing
        // this row's dirty metaslabs reclaims its blocks and TXGs.
        debug_assert!(available_blocks < 0 || available_txgs < 0);
        available_blocks += row.blkcount as i64;
        available_txgs += row.txgcount as i64;
        total_flushes += row.msdcount;

        max_flushes_per_txg =
            max_flushes_per_txg.max(total_flushes.div_ceil(txgs_in_future));
    }

    max_flushes_per_txg
}

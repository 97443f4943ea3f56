//! The log summary: a queue of coarse rows aggregating the registry's
//! per-log metaslab and block counts.
//!
//! The flush scheduler plans by walking this queue instead of every log, so
//! its cost is bounded by the row limit rather than the number of TXGs in
//! the log. Rows accrue at the tail as logs close and drain from the head as
//! metaslabs flush and old logs are destroyed.

use std::collections::VecDeque;

/// One summary row covering the inclusive TXG range `[start, end]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryRow {
    /// First TXG covered by this row.
    pub start: u64,
    /// Last TXG covered by this row.
    pub end: u64,
    /// Number of TXGs that contributed data to this row.
    pub txgcount: u64,
    /// Metaslabs whose watermark falls in this row's range.
    pub mscount: u64,
    /// Subset of `mscount` that have unflushed changes again.
    pub msdcount: u64,
    /// Log blocks accounted to this row's range.
    pub blkcount: u64,
}

/// Queue of summary rows, oldest at the head.
#[derive(Debug, Default)]
pub(crate) struct LogSummary {
    rows: VecDeque<SummaryRow>,
}

impl LogSummary {
    /// Folds data for `txg` into the tail row, opening a new row when the
    /// tail is full.
    ///
    /// `txgs_per_row` and `blocks_per_row` are the fullness thresholds; a
    /// row whose `end` already equals `txg` always extends, so one TXG's
    /// data is never split across rows.
    pub fn add_data(
        &mut self,
        txg: u64,
        flushed: u64,
        dirty: u64,
        nblocks: u64,
        txgs_per_row: u64,
        blocks_per_row: u64,
    ) {
        let needs_row = match self.rows.back() {
            None => true,
            Some(row) => row_is_full(row, txg, txgs_per_row, blocks_per_row),
        };
        if needs_row {
            self.rows.push_back(SummaryRow {
                start: txg,
                end: txg,
                txgcount: 1,
                ..SummaryRow::default()
            });
        }

        let row = self.rows.back_mut().expect("tail row just ensured");
        debug_assert!(row.start <= txg, "summary data arriving out of order");
        if row.end < txg {
            row.end = txg;
            row.txgcount += 1;
        }
        row.mscount += flushed;
        row.msdcount += dirty;
        row.blkcount += nblocks;
    }

    /// Records a metaslab flushed in `txg` (`dirty` when it still carries
    /// unflushed changes, i.e. it was just created by this TXG's sync).
    pub fn add_flushed_metaslab(
        &mut self,
        txg: u64,
        dirty: bool,
        txgs_per_row: u64,
        blocks_per_row: u64,
    ) {
        self.add_data(txg, 1, u64::from(dirty), 0, txgs_per_row, blocks_per_row);
    }

    /// Adds the block count of the log closed in `txg` to the tail.
    pub fn add_incoming_blocks(
        &mut self,
        txg: u64,
        nblocks: u64,
        txgs_per_row: u64,
        blocks_per_row: u64,
    ) {
        self.add_data(txg, 0, 0, nblocks, txgs_per_row, blocks_per_row);
    }

    /// Marks a previously-clean flushed metaslab dirty again, bumping the
    /// dirty count of the row covering its watermark.
    pub fn dirty_flushed_metaslab(&mut self, txg: u64) {
        let row = self
            .row_for_mut(txg)
            .expect("dirtying a metaslab with no summary row");
        debug_assert!(row.mscount != 0);
        row.msdcount += 1;
    }

    /// Removes one metaslab (dirty or not) from the row covering `txg`.
    ///
    /// A metaslab is not always accounted by the head row: flushes can skip
    /// past a loading metaslab, and teardown walks metaslabs in layout
    /// order, so the row is located by `txg`. Returns `false` when no row
    /// accounts the metaslab, which callers tolerate only while tearing
    /// down a failed load.
    pub fn decrement_mscount(&mut self, txg: u64, dirty: bool) -> bool {
        let Some(row) = self.row_for_mut(txg) else {
            return false;
        };
        if row.mscount == 0 {
            return false;
        }
        row.mscount -= 1;
        if dirty {
            debug_assert!(row.msdcount > 0, "msdcount underflow at txg {txg}");
            row.msdcount = row.msdcount.saturating_sub(1);
        }
        true
    }

    /// Retires `blocks_gone` blocks of destroyed logs from the head of the
    /// queue, discarding rows that empty out.
    ///
    /// Only the oldest logs are ever destroyed, so the blocks always come
    /// off the head. Three shapes arise:
    /// - the head row has more blocks than we retire: decrement and stop;
    /// - head rows hold no metaslabs any more (their metaslabs were
    ///   re-flushed or torn down): pop them while consuming their blocks;
    /// - a pool-wide mass flush leaves a single row holding every metaslab
    ///   but no remaining blocks: the row's block count drops to zero and
    ///   the row is kept, since the syncing log's blocks land back on it at
    ///   end of TXG.
    ///
    /// Returns `false` when asked to retire more blocks than the summary
    /// holds, an impossible-counter state.
    pub fn decrement_blocks(&mut self, blocks_gone: u64) -> bool {
        let Some(head) = self.rows.front_mut() else {
            return false;
        };
        // One log means one TXG left the queue's span.
        if head.txgcount > 0 {
            head.txgcount -= 1;
        }

        let mut gone = blocks_gone;
        let mut rows_left = self.rows.len();
        while let Some(row) = self.rows.front_mut() {
            if row.blkcount > gone {
                row.blkcount -= gone;
                gone = 0;
                break;
            } else if row.mscount == 0 {
                gone -= row.blkcount;
                self.rows.pop_front();
                rows_left -= 1;
            } else {
                // Mass-flush corner: this must be the lone surviving row and
                // the retired blocks must be exactly its block count.
                if gone != row.blkcount || rows_left != 1 {
                    return false;
                }
                row.blkcount = 0;
                gone = 0;
                break;
            }
        }
        gone == 0
    }

    pub fn rows(&self) -> impl Iterator<Item = &SummaryRow> {
        self.rows.iter()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn mscount_total(&self) -> u64 {
        self.rows.iter().map(|r| r.mscount).sum()
    }

    pub fn msdcount_total(&self) -> u64 {
        self.rows.iter().map(|r| r.msdcount).sum()
    }

    pub fn blkcount_total(&self) -> u64 {
        self.rows.iter().map(|r| r.blkcount).sum()
    }

    pub fn txgcount_total(&self) -> u64 {
        self.rows.iter().map(|r| r.txgcount).sum()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    #[cfg(test)]
    pub fn push_row(&mut self, row: SummaryRow) {
        self.rows.push_back(row);
    }

    /// The last row whose range starts at or before `txg`.
    fn row_for_mut(&mut self, txg: u64) -> Option<&mut SummaryRow> {
        let mut target = None;
        for (i, row) in self.rows.iter().enumerate() {
            if row.start > txg {
                break;
            }
            target = Some(i);
        }
        target.and_then(|i| self.rows.get_mut(i))
    }
}

/// A row stops accepting data once it spans enough TXGs or blocks, except
/// that data for a TXG it already covers always extends it.
fn row_is_full(row: &SummaryRow, txg: u64, txgs_per_row: u64, blocks_per_row: u64) -> bool {
    if row.end == txg {
        return false;
    }
    row.txgcount >= txgs_per_row || row.blkcount >= blocks_per_row
}

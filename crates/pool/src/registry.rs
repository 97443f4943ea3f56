//! The pool-wide log registry: every live log space map ordered by TXG,
//! plus the handle of the log currently being appended.

use std::collections::BTreeMap;

use spacemap::SpaceMap;

/// Registry bookkeeping for one log space map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LogEntry {
    /// Backing object id.
    pub object: u64,
    /// Physical blocks, filled in when the log is closed (or read at load).
    pub nblocks: u64,
    /// Number of metaslabs whose watermark names this log's TXG. The oldest
    /// log is obsolete exactly when this hits zero.
    pub mscount: u64,
}

/// Ordered collection of the pool's log space maps.
///
/// The syncing log, when present, is always the newest entry: it is created
/// for the current TXG and the handle is cleared when the log is closed at
/// the end of that TXG.
#[derive(Debug, Default)]
pub(crate) struct LogRegistry {
    by_txg: BTreeMap<u64, LogEntry>,
    syncing: Option<SpaceMap>,
}

impl LogRegistry {
    /// Inserts a registry entry for a new log.
    pub fn add(&mut self, txg: u64, object: u64) {
        let prev = self.by_txg.insert(
            txg,
            LogEntry {
                object,
                nblocks: 0,
                mscount: 0,
            },
        );
        debug_assert!(prev.is_none(), "duplicate log for txg {txg}");
    }

    /// Removes and returns the oldest log.
    ///
    /// Fails when the oldest log is still referenced by a metaslab
    /// watermark; destroying it then would lose unflushed changes.
    pub fn remove_oldest(&mut self) -> Result<(u64, LogEntry), (u64, u64)> {
        let (&txg, entry) = self
            .by_txg
            .first_key_value()
            .expect("remove_oldest on empty registry");
        if entry.mscount != 0 {
            debug_assert!(false, "destroying log {txg} with mscount {}", entry.mscount);
            return Err((txg, entry.mscount));
        }
        let entry = self.by_txg.remove(&txg).expect("entry just observed");
        Ok((txg, entry))
    }

    pub fn lookup(&self, txg: u64) -> Option<&LogEntry> {
        self.by_txg.get(&txg)
    }

    pub fn oldest(&self) -> Option<(u64, &LogEntry)> {
        self.by_txg.first_key_value().map(|(&t, e)| (t, e))
    }

    pub fn newest(&self) -> Option<(u64, &LogEntry)> {
        self.by_txg.last_key_value().map(|(&t, e)| (t, e))
    }

    /// Records the block count of the log for `txg` once it is known.
    pub fn set_nblocks(&mut self, txg: u64, nblocks: u64) {
        if let Some(entry) = self.by_txg.get_mut(&txg) {
            entry.nblocks = nblocks;
        } else {
            debug_assert!(false, "set_nblocks for unknown log {txg}");
        }
    }

    /// Counts a metaslab flushed in `txg` against that log. The target must
    /// be the newest log (flushes always land on the syncing TXG).
    pub fn mscount_inc(&mut self, txg: u64) -> bool {
        match self.by_txg.last_entry() {
            Some(mut entry) if *entry.key() == txg => {
                entry.get_mut().mscount += 1;
                true
            }
            _ => {
                debug_assert!(false, "mscount_inc for non-syncing log {txg}");
                false
            }
        }
    }

    /// Counts a metaslab watermark against the log for `txg`, wherever it
    /// sits in the registry. Load-time only; live flushes go through
    /// [`mscount_inc`](LogRegistry::mscount_inc).
    pub fn mscount_inc_at(&mut self, txg: u64) -> bool {
        match self.by_txg.get_mut(&txg) {
            Some(entry) => {
                entry.mscount += 1;
                true
            }
            None => false,
        }
    }

    /// Drops a metaslab reference from the log for `txg`.
    ///
    /// Returns `false` if no such log exists; callers tolerate that only
    /// while tearing down a failed load.
    pub fn mscount_dec(&mut self, txg: u64) -> bool {
        match self.by_txg.get_mut(&txg) {
            Some(entry) => {
                debug_assert!(entry.mscount > 0, "mscount underflow for log {txg}");
                entry.mscount = entry.mscount.saturating_sub(1);
                true
            }
            None => false,
        }
    }

    /// Iterates `(txg, entry)` pairs in ascending TXG order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (u64, &LogEntry)> {
        self.by_txg.iter().map(|(&t, e)| (t, e))
    }

    pub fn len(&self) -> usize {
        self.by_txg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_txg.is_empty()
    }

    pub fn syncing(&self) -> Option<&SpaceMap> {
        self.syncing.as_ref()
    }

    pub fn syncing_mut(&mut self) -> Option<&mut SpaceMap> {
        self.syncing.as_mut()
    }

    pub fn set_syncing(&mut self, sm: SpaceMap) {
        debug_assert!(self.syncing.is_none(), "syncing log already present");
        self.syncing = Some(sm);
    }

    pub fn take_syncing(&mut self) -> Option<SpaceMap> {
        self.syncing.take()
    }

    /// Drops all in-memory entries (objects on disk are untouched).
    pub fn clear(&mut self) {
        self.by_txg.clear();
        self.syncing = None;
    }
}

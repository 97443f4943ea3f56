//! The in-memory metaslab model: per-metaslab unflushed change sets, the
//! flush watermark, and this TXG's staged changes.

use rangeset::RangeSet;
use spacemap::SpaceMap;

/// One top-level vdev and its metaslabs.
#[derive(Debug)]
pub(crate) struct Vdev {
    /// Minimum block shift; all extents are aligned to `1 << ashift`.
    pub ashift: u32,
    /// Metaslab size shift; a vdev-relative offset's metaslab is
    /// `offset >> ms_shift`.
    pub ms_shift: u32,
    /// The vdev's top ZAP, naming the two per-metaslab record arrays.
    pub top_zap: u64,
    /// Object holding one space map object id per metaslab.
    pub ms_array_obj: u64,
    /// Object holding one `unflushed_txg` watermark per metaslab.
    pub unflushed_obj: u64,
    pub metaslabs: Vec<Metaslab>,
}

/// One metaslab's in-memory state.
///
/// `unflushed_allocs` and `unflushed_frees` hold the changes that are in
/// the log but not yet in this metaslab's own space map; they are always
/// disjoint. `unflushed_txg` is the watermark: log records from TXGs at or
/// after it still apply to this metaslab, older ones are already baked into
/// the space map. A watermark of zero means the metaslab has never been
/// through a logged sync.
#[derive(Debug, Default)]
pub(crate) struct Metaslab {
    /// The metaslab's own space map, created on first flush.
    pub sm: Option<SpaceMap>,
    /// Net allocated bytes, including unflushed changes.
    pub allocated: i64,

    pub unflushed_allocs: RangeSet,
    pub unflushed_frees: RangeSet,
    pub unflushed_txg: u64,
    pub unflushed_dirty: bool,

    /// Changes staged by the allocation hot path for the open TXG, applied
    /// and logged by the next sync.
    pub staged_allocs: RangeSet,
    pub staged_frees: RangeSet,
}

impl Metaslab {
    pub fn new() -> Self {
        Self::default()
    }

    /// Heap bytes retained by the unflushed change sets.
    pub fn memused(&self) -> u64 {
        self.unflushed_allocs.memused() + self.unflushed_frees.memused()
    }

    /// Whether the open TXG staged any changes for this metaslab.
    pub fn has_staged(&self) -> bool {
        !self.staged_allocs.is_empty() || !self.staged_frees.is_empty()
    }
}

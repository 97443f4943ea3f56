//! # SpaceMap - on-disk allocation/free record streams
//!
//! Space maps are the persistent form of allocation state in the pool
//! engine. Two flavours share this one format:
//!
//! - **Metaslab space maps** — per-metaslab streams that accumulate the
//!   flushed history of one allocation region.
//! - **Log space maps** — one pool-wide stream per TXG batching every
//!   metaslab's changes for that TXG, replayed at import and destroyed once
//!   all of their entries have been flushed into metaslab space maps.
//!
//! ## Object layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ DATA (append-only 8-byte record words)                       │
//! │                                                              │
//! │ LOC   kind | vdev | run | offset      one allocation/free    │
//! │ SKIP  txg gap                         advances replay cursor │
//! │                                                              │
//! │ ... chunked every 16 MiB for checksumming ...                │
//! ├──────────────────────────────────────────────────────────────┤
//! │ PADDING (zeros to a whole block, written at close)           │
//! └──────────────────────────────────────────────────────────────┘
//! BONUS: magic | shift | length | alloc | nchunks | crc32 ...
//! ```
//!
//! All integers are little-endian. Record and header layouts live in
//! [`format`]; [`SpaceMap`] appends, [`SpaceMapReader`] validates and
//! replays. A record never spans a checksum chunk boundary, so a chunk can
//! always be verified and decoded independently.

mod format;
mod reader;
mod writer;

pub use format::{
    Header, Record, SegmentKind, CHUNK_BYTES, ENTRY_BYTES, OFFSET_MAX, RUN_MAX, SKIP_MAX,
    SPACEMAP_MAGIC, VDEV_MAX,
};
pub use reader::{SpaceMapEntry, SpaceMapReader};
pub use writer::SpaceMap;

use thiserror::Error;

/// Errors surfaced by space map encoding, decoding, and I/O.
#[derive(Debug, Error)]
pub enum SpaceMapError {
    /// An error from the backing object store.
    #[error(transparent)]
    Mos(#[from] mos::MosError),

    /// A malformed header, record, or checksum mismatch.
    #[error("corrupt space map: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests;

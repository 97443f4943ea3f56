//! Space map binary format: 8-byte record words and the header kept in the
//! backing object's bonus buffer.
//!
//! ## Record words (64 bits, little-endian on disk)
//!
//! ```text
//! LOC   [63:62]=01 [61]=kind (0=ALLOC 1=FREE) [60:49]=vdev [48:34]=run-1 [33:0]=offset
//! SKIP  [63:62]=10 [61:0]=skip_count
//! ```
//!
//! Offsets and runs are stored in units of `1 << shift` bytes, where `shift`
//! comes from the header. A LOC's run field holds `run - 1`, so a single
//! word describes up to [`RUN_MAX`] units; longer extents are split into
//! consecutive words by the encoder. A SKIP advances the decoder's TXG
//! cursor by `skip_count` without yielding a segment.
//!
//! ## Header (bonus buffer)
//!
//! ```text
//! [magic: u32 "SPM1"][shift: u32][length: u64][alloc: i64][nchunks: u32][crc32 ...]
//! ```
//!
//! `length` is the logical byte length of the record stream; data past it
//! (the end-of-object padding added when a log is closed) is ignored. The
//! stream is split into [`CHUNK_BYTES`] chunks, each covered by one CRC32 in
//! the header; the final (possibly partial) chunk's CRC covers the bytes
//! written so far. Chunk size is a multiple of the record size, so a record
//! never spans a chunk boundary.

use byteorder::{ByteOrder, LittleEndian};

use crate::SpaceMapError;

/// Magic number identifying space map headers (ASCII "SPM1").
pub const SPACEMAP_MAGIC: u32 = 0x5350_4D31;

/// Size of one record word in bytes.
pub const ENTRY_BYTES: u64 = 8;

/// Chunk granularity of the record stream's checksums (16 MiB).
pub const CHUNK_BYTES: u64 = 16 * 1024 * 1024;

/// Fixed header bytes before the per-chunk checksums.
pub const HEADER_FIXED_BYTES: usize = 4 + 4 + 8 + 8 + 4;

// A record must never span a chunk boundary.
const _: () = assert!(CHUNK_BYTES % ENTRY_BYTES == 0);

const TYPE_SHIFT: u32 = 62;
const TYPE_LOC: u64 = 0b01;
const TYPE_SKIP: u64 = 0b10;

const KIND_SHIFT: u32 = 61;

const VDEV_BITS: u32 = 12;
const VDEV_SHIFT: u32 = 49;

const RUN_BITS: u32 = 15;
const RUN_SHIFT: u32 = 34;

const OFFSET_BITS: u32 = 34;

/// Largest run (in units) a single LOC word can carry.
pub const RUN_MAX: u64 = 1 << RUN_BITS;

/// Largest offset (in units) a LOC word can carry.
pub const OFFSET_MAX: u64 = (1 << OFFSET_BITS) - 1;

/// Largest vdev id a LOC word can carry.
pub const VDEV_MAX: u32 = (1 << VDEV_BITS) - 1;

/// Largest TXG count a single SKIP word can carry.
pub const SKIP_MAX: u64 = (1 << TYPE_SHIFT) - 1;

/// Whether a record describes an allocation or a free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Alloc,
    Free,
}

/// A decoded record word. Offsets and runs are in `1 << shift` units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    Loc {
        kind: SegmentKind,
        vdev: u32,
        offset: u64,
        run: u64,
    },
    Skip(u64),
}

/// Encodes one extent as LOC words, splitting runs longer than [`RUN_MAX`].
///
/// # Panics
///
/// The vdev id and the whole offset span must fit their fields; violations
/// are caller bugs.
pub fn encode_loc(kind: SegmentKind, vdev: u32, offset: u64, run: u64, words: &mut Vec<u64>) {
    assert!(run > 0, "empty extent");
    assert!(vdev <= VDEV_MAX, "vdev {vdev} out of range");
    assert!(
        offset + run - 1 <= OFFSET_MAX,
        "extent [{offset}, +{run}) out of range"
    );

    let kind_bit = match kind {
        SegmentKind::Alloc => 0u64,
        SegmentKind::Free => 1u64,
    };

    let mut offset = offset;
    let mut remaining = run;
    while remaining > 0 {
        let this_run = remaining.min(RUN_MAX);
        words.push(
            (TYPE_LOC << TYPE_SHIFT)
                | (kind_bit << KIND_SHIFT)
                | (u64::from(vdev) << VDEV_SHIFT)
                | ((this_run - 1) << RUN_SHIFT)
                | offset,
        );
        offset += this_run;
        remaining -= this_run;
    }
}

/// Encodes a TXG gap as a SKIP word.
pub fn encode_skip(txgs: u64, words: &mut Vec<u64>) {
    assert!(txgs > 0 && txgs <= SKIP_MAX, "skip count {txgs} out of range");
    words.push((TYPE_SKIP << TYPE_SHIFT) | txgs);
}

/// Decodes one record word.
pub fn decode_word(word: u64) -> Result<Record, SpaceMapError> {
    match word >> TYPE_SHIFT {
        TYPE_LOC => {
            let kind = if word >> KIND_SHIFT & 1 == 0 {
                SegmentKind::Alloc
            } else {
                SegmentKind::Free
            };
            Ok(Record::Loc {
                kind,
                vdev: (word >> VDEV_SHIFT & u64::from(VDEV_MAX)) as u32,
                offset: word & OFFSET_MAX,
                run: (word >> RUN_SHIFT & (RUN_MAX - 1)) + 1,
            })
        }
        TYPE_SKIP => Ok(Record::Skip(word & SKIP_MAX)),
        tag => Err(SpaceMapError::Corrupt(format!(
            "unknown record type tag {tag:#b}"
        ))),
    }
}

/// Parsed space map header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Unit shift: offsets and runs are stored in `1 << shift` byte units.
    pub shift: u32,
    /// Logical byte length of the record stream.
    pub length: u64,
    /// Net allocated bytes recorded by the stream (allocs minus frees).
    pub alloc: i64,
    /// CRC32 per chunk, covering `length` bytes of records.
    pub chunk_crcs: Vec<u32>,
}

impl Header {
    /// Serializes the header for the object's bonus buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_FIXED_BYTES + self.chunk_crcs.len() * 4);
        buf.extend_from_slice(&SPACEMAP_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.shift.to_le_bytes());
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.alloc.to_le_bytes());
        buf.extend_from_slice(&(self.chunk_crcs.len() as u32).to_le_bytes());
        for crc in &self.chunk_crcs {
            buf.extend_from_slice(&crc.to_le_bytes());
        }
        buf
    }

    /// Parses a header from an object's bonus buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SpaceMapError> {
        if bytes.len() < HEADER_FIXED_BYTES {
            return Err(SpaceMapError::Corrupt("space map header truncated".into()));
        }
        if LittleEndian::read_u32(&bytes[0..4]) != SPACEMAP_MAGIC {
            return Err(SpaceMapError::Corrupt(format!(
                "bad space map magic {:#x}",
                LittleEndian::read_u32(&bytes[0..4])
            )));
        }
        let shift = LittleEndian::read_u32(&bytes[4..8]);
        let length = LittleEndian::read_u64(&bytes[8..16]);
        let alloc = LittleEndian::read_i64(&bytes[16..24]);
        let nchunks = LittleEndian::read_u32(&bytes[24..28]) as usize;
        if bytes.len() != HEADER_FIXED_BYTES + nchunks * 4 {
            return Err(SpaceMapError::Corrupt(
                "space map header length mismatch".into(),
            ));
        }
        if nchunks as u64 != length.div_ceil(CHUNK_BYTES) {
            return Err(SpaceMapError::Corrupt(format!(
                "chunk count {nchunks} does not cover {length} record bytes"
            )));
        }
        let mut chunk_crcs = Vec::with_capacity(nchunks);
        for i in 0..nchunks {
            let off = HEADER_FIXED_BYTES + i * 4;
            chunk_crcs.push(LittleEndian::read_u32(&bytes[off..off + 4]));
        }
        Ok(Self {
            shift,
            length,
            alloc,
            chunk_crcs,
        })
    }
}

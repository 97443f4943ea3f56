use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher as Crc32;
use mos::Mos;

use crate::format::{decode_word, Header, Record, CHUNK_BYTES, ENTRY_BYTES};
use crate::{SegmentKind, SpaceMapError};

/// One decoded segment yielded during iteration.
///
/// Offsets and runs are in bytes; `txg` is the decoder's cursor position,
/// i.e. the map's base TXG advanced by any SKIP records seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceMapEntry {
    pub kind: SegmentKind,
    pub vdev: u32,
    pub offset: u64,
    pub run: u64,
    pub txg: u64,
}

/// Reads and validates a space map object for replay.
///
/// Opening verifies the object's shape (a closed map is padded to whole
/// blocks; the logical length never exceeds the physical length) and every
/// chunk checksum before any record is decoded. Iteration then walks the
/// validated record stream front to back.
pub struct SpaceMapReader {
    object: u64,
    blksz: u32,
    header: Header,
    data: Vec<u8>,
}

impl SpaceMapReader {
    /// Opens a space map object, verifying structure and chunk checksums.
    ///
    /// # Errors
    ///
    /// Returns [`SpaceMapError::Corrupt`] if the header is malformed, the
    /// object is shorter than the header's record length, a closed object's
    /// length is not a whole number of blocks, or any chunk checksum
    /// mismatches.
    pub fn open(mos: &Mos, object: u64) -> Result<Self, SpaceMapError> {
        let header = Header::from_bytes(&mos.bonus_read(object)?)?;
        let blksz = mos.object_blksz(object)?;
        let phys_len = mos.object_len(object)?;

        if header.length > phys_len {
            return Err(SpaceMapError::Corrupt(format!(
                "object {object}: {} record bytes but only {} on disk",
                header.length, phys_len
            )));
        }
        // Anything between "still being appended" (no padding yet) and
        // "closed" (padded to the block size) is a torn or truncated object.
        if phys_len != header.length && phys_len % blksz as u64 != 0 {
            return Err(SpaceMapError::Corrupt(format!(
                "object {object}: length {phys_len} is not a multiple of the {blksz}-byte block size"
            )));
        }
        if header.length % ENTRY_BYTES != 0 {
            return Err(SpaceMapError::Corrupt(format!(
                "object {object}: record stream length {} not a multiple of {ENTRY_BYTES}",
                header.length
            )));
        }

        let data = mos.read_at(object, 0, header.length as usize)?;
        for (i, &expected) in header.chunk_crcs.iter().enumerate() {
            let lo = i as u64 * CHUNK_BYTES;
            let hi = (lo + CHUNK_BYTES).min(header.length);
            let mut hasher = Crc32::new();
            hasher.update(&data[lo as usize..hi as usize]);
            if hasher.finalize() != expected {
                return Err(SpaceMapError::Corrupt(format!(
                    "object {object}: checksum mismatch in chunk {i}"
                )));
            }
        }

        Ok(Self {
            object,
            blksz,
            header,
            data,
        })
    }

    /// Decodes every record, calling `visit` for each segment.
    ///
    /// The TXG cursor starts at `base_txg` and advances by SKIP records;
    /// each yielded entry carries the cursor value it was decoded at.
    pub fn iterate<F>(&self, base_txg: u64, mut visit: F) -> Result<(), SpaceMapError>
    where
        F: FnMut(&SpaceMapEntry),
    {
        let unit = 1u64 << self.header.shift;
        let mut txg = base_txg;

        for word_bytes in self.data.chunks_exact(ENTRY_BYTES as usize) {
            match decode_word(LittleEndian::read_u64(word_bytes))? {
                Record::Loc {
                    kind,
                    vdev,
                    offset,
                    run,
                } => visit(&SpaceMapEntry {
                    kind,
                    vdev,
                    offset: offset * unit,
                    run: run * unit,
                    txg,
                }),
                Record::Skip(n) => txg += n,
            }
        }
        Ok(())
    }

    /// Physical blocks occupied by the record stream.
    #[must_use]
    pub fn nblocks(&self) -> u64 {
        self.header.length.div_ceil(self.blksz as u64)
    }

    /// Logical byte length of the record stream.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.header.length
    }

    /// Net allocated bytes recorded (allocs minus frees).
    #[must_use]
    pub fn allocated(&self) -> i64 {
        self.header.alloc
    }

    /// Backing object id.
    #[must_use]
    pub fn object(&self) -> u64 {
        self.object
    }
}

use crc32fast::Hasher as Crc32;
use mos::{Mos, Tx};
use rangeset::RangeSet;

use crate::format::{
    encode_loc, encode_skip, Header, CHUNK_BYTES, ENTRY_BYTES, RUN_MAX, SKIP_MAX,
};
use crate::{SegmentKind, SpaceMapError};

/// An appendable space map backed by a `mos` object.
///
/// One instance exists per metaslab space map and one per syncing log space
/// map. Records are buffered per call, appended to the object in a single
/// write, and the header (logical length, net allocated bytes, chunk
/// checksums) is re-persisted in the object's bonus buffer after every
/// append, so readers always see a self-describing object.
///
/// The writer hashes the record stream into 16 MiB chunks as it goes. A
/// partially-filled tail chunk keeps its running CRC in the header too;
/// re-opening an existing map rebuilds the running hasher from the tail
/// bytes and verifies it against the stored value.
pub struct SpaceMap {
    object: u64,
    blksz: u32,
    shift: u32,
    length: u64,
    alloc: i64,
    /// CRCs of sealed (full) chunks.
    sealed_crcs: Vec<u32>,
    /// Running hasher and byte count of the open tail chunk.
    open_crc: Crc32,
    open_len: u64,
}

impl std::fmt::Debug for SpaceMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceMap")
            .field("object", &self.object)
            .field("blksz", &self.blksz)
            .field("shift", &self.shift)
            .field("length", &self.length)
            .field("alloc", &self.alloc)
            .finish()
    }
}

impl SpaceMap {
    /// Creates a new empty space map object with the given block size and
    /// unit shift.
    pub fn create(mos: &mut Mos, blksz: u32, shift: u32, tx: &Tx) -> Result<Self, SpaceMapError> {
        let object = mos.object_create(blksz, tx)?;
        let sm = Self {
            object,
            blksz,
            shift,
            length: 0,
            alloc: 0,
            sealed_crcs: Vec::new(),
            open_crc: Crc32::new(),
            open_len: 0,
        };
        mos.bonus_write(object, &sm.header().to_bytes(), tx)?;
        Ok(sm)
    }

    /// Opens an existing space map for appending, rebuilding the tail
    /// chunk's running checksum from the object's data.
    pub fn open(mos: &Mos, object: u64) -> Result<Self, SpaceMapError> {
        let header = Header::from_bytes(&mos.bonus_read(object)?)?;
        let blksz = mos.object_blksz(object)?;

        let sealed = (header.length / CHUNK_BYTES) as usize;
        let sealed_crcs = header.chunk_crcs[..sealed].to_vec();
        let open_len = header.length % CHUNK_BYTES;

        let mut open_crc = Crc32::new();
        if open_len > 0 {
            let tail = mos.read_at(object, sealed as u64 * CHUNK_BYTES, open_len as usize)?;
            open_crc.update(&tail);
            if open_crc.clone().finalize() != header.chunk_crcs[sealed] {
                return Err(SpaceMapError::Corrupt(format!(
                    "object {object}: tail chunk checksum mismatch"
                )));
            }
        }

        Ok(Self {
            object,
            blksz,
            shift: header.shift,
            length: header.length,
            alloc: header.alloc,
            sealed_crcs,
            open_crc,
            open_len,
        })
    }

    /// Appends one extent (byte offset and run) of the given kind.
    ///
    /// Extents are converted to `1 << shift` units; runs longer than a
    /// single record carries are split across consecutive records.
    pub fn append_segment(
        &mut self,
        mos: &mut Mos,
        tx: &Tx,
        kind: SegmentKind,
        vdev: u32,
        offset: u64,
        run: u64,
    ) -> Result<(), SpaceMapError> {
        let unit = 1u64 << self.shift;
        assert!(
            offset % unit == 0 && run % unit == 0,
            "extent [{offset}, +{run}) not aligned to {unit}-byte units"
        );

        let mut words = Vec::with_capacity(((run / unit) / RUN_MAX + 1) as usize);
        encode_loc(kind, vdev, offset / unit, run / unit, &mut words);
        self.write_words(mos, tx, &words)?;

        match kind {
            SegmentKind::Alloc => self.alloc += run as i64,
            SegmentKind::Free => self.alloc -= run as i64,
        }
        mos.bonus_write(self.object, &self.header().to_bytes(), tx)?;
        Ok(())
    }

    /// Appends every segment of a range set with the given kind.
    pub fn append_set(
        &mut self,
        mos: &mut Mos,
        tx: &Tx,
        set: &RangeSet,
        kind: SegmentKind,
        vdev: u32,
    ) -> Result<(), SpaceMapError> {
        for (lo, hi) in set.iter() {
            self.append_segment(mos, tx, kind, vdev, lo, hi - lo)?;
        }
        Ok(())
    }

    /// Appends a SKIP record annotating a gap of `txgs` TXGs with no
    /// entries.
    pub fn append_skip(&mut self, mos: &mut Mos, tx: &Tx, txgs: u64) -> Result<(), SpaceMapError> {
        let mut remaining = txgs;
        let mut words = Vec::with_capacity(1);
        while remaining > 0 {
            let this = remaining.min(SKIP_MAX);
            encode_skip(this, &mut words);
            remaining -= this;
        }
        self.write_words(mos, tx, &words)?;
        mos.bonus_write(self.object, &self.header().to_bytes(), tx)?;
        Ok(())
    }

    /// Closes the map: pads the object to a whole number of blocks, persists
    /// the final header, and returns the physical block count.
    pub fn close(self, mos: &mut Mos, tx: &Tx) -> Result<u64, SpaceMapError> {
        let pad = (self.blksz as u64 - self.length % self.blksz as u64) % self.blksz as u64;
        if pad > 0 {
            mos.append(self.object, &vec![0u8; pad as usize], tx)?;
        }
        mos.bonus_write(self.object, &self.header().to_bytes(), tx)?;
        Ok(self.nblocks())
    }

    /// Frees a space map object.
    pub fn destroy(mos: &mut Mos, object: u64, tx: &Tx) -> Result<(), SpaceMapError> {
        mos.object_free(object, tx)?;
        Ok(())
    }

    /// Physical blocks occupied by the record stream.
    #[must_use]
    pub fn nblocks(&self) -> u64 {
        self.length.div_ceil(self.blksz as u64)
    }

    /// Logical byte length of the record stream.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Net allocated bytes recorded (allocs minus frees).
    #[must_use]
    pub fn allocated(&self) -> i64 {
        self.alloc
    }

    /// Backing object id.
    #[must_use]
    pub fn object(&self) -> u64 {
        self.object
    }

    /// Unit shift of encoded offsets and runs.
    #[must_use]
    pub fn shift(&self) -> u32 {
        self.shift
    }

    fn header(&self) -> Header {
        let mut chunk_crcs = self.sealed_crcs.clone();
        if self.open_len > 0 {
            chunk_crcs.push(self.open_crc.clone().finalize());
        }
        Header {
            shift: self.shift,
            length: self.length,
            alloc: self.alloc,
            chunk_crcs,
        }
    }

    fn write_words(&mut self, mos: &mut Mos, tx: &Tx, words: &[u64]) -> Result<(), SpaceMapError> {
        let mut buf = Vec::with_capacity(words.len() * ENTRY_BYTES as usize);
        for &word in words {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        // Append before advancing any checksum state, so a failed write
        // leaves the map consistent for a retry.
        mos.append(self.object, &buf, tx)?;

        for bytes in buf.chunks_exact(ENTRY_BYTES as usize) {
            self.open_crc.update(bytes);
            self.open_len += ENTRY_BYTES;
            if self.open_len == CHUNK_BYTES {
                let crc = std::mem::take(&mut self.open_crc).finalize();
                self.sealed_crcs.push(crc);
                self.open_len = 0;
            }
        }
        self.length += buf.len() as u64;
        Ok(())
    }
}

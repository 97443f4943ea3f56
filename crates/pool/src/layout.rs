//! Persisted pool geometry: just enough vdev/metaslab shape for a reload
//! to rebuild the in-memory model. Full pool configuration lives outside
//! this engine.
//!
//! ## Record format
//!
//! ```text
//! [magic: u32 "PLY1"][nvdevs: u32]
//! per vdev: [ashift: u32][ms_shift: u32][ms_count: u32][top_zap: u64]
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::PoolError;

/// Magic number identifying the layout record (ASCII "PLY1").
const LAYOUT_MAGIC: u32 = 0x504C_5931;

/// Shape of one top-level vdev at pool creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VdevLayout {
    /// Minimum block shift; extents must align to `1 << ashift`.
    pub ashift: u32,
    /// Metaslab size is `1 << ms_shift` bytes.
    pub ms_shift: u32,
    /// Number of metaslabs in the vdev.
    pub ms_count: u32,
}

pub(crate) fn serialize_layout(vdevs: &[(VdevLayout, u64)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + vdevs.len() * 20);
    buf.extend_from_slice(&LAYOUT_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(vdevs.len() as u32).to_le_bytes());
    for (layout, top_zap) in vdevs {
        buf.extend_from_slice(&layout.ashift.to_le_bytes());
        buf.extend_from_slice(&layout.ms_shift.to_le_bytes());
        buf.extend_from_slice(&layout.ms_count.to_le_bytes());
        buf.extend_from_slice(&top_zap.to_le_bytes());
    }
    buf
}

pub(crate) fn parse_layout(bytes: &[u8]) -> Result<Vec<(VdevLayout, u64)>, PoolError> {
    if bytes.len() < 8 || LittleEndian::read_u32(&bytes[0..4]) != LAYOUT_MAGIC {
        return Err(PoolError::Corruption("malformed pool layout record"));
    }
    let nvdevs = LittleEndian::read_u32(&bytes[4..8]) as usize;
    if bytes.len() != 8 + nvdevs * 20 {
        return Err(PoolError::Corruption("pool layout record length mismatch"));
    }

    let mut vdevs = Vec::with_capacity(nvdevs);
    for i in 0..nvdevs {
        let off = 8 + i * 20;
        vdevs.push((
            VdevLayout {
                ashift: LittleEndian::read_u32(&bytes[off..off + 4]),
                ms_shift: LittleEndian::read_u32(&bytes[off + 4..off + 8]),
                ms_count: LittleEndian::read_u32(&bytes[off + 8..off + 12]),
            },
            LittleEndian::read_u64(&bytes[off + 12..off + 20]),
        ));
    }
    Ok(vdevs)
}

//! # MOS - Meta Object Store
//!
//! A minimal file-backed object store standing in for a pool's meta object
//! set: numbered byte objects with a per-object block size and a small
//! "bonus" buffer, plus 64-bit-keyed persistent maps (ZAPs) serialized into
//! ordinary objects. Space map logs, metaslab space maps, watermark arrays,
//! and the pool directory all live here.
//!
//! ## On-disk layout
//!
//! ```text
//! <root>/objects/obj-<id>.dat    raw object bytes (append / random access)
//! <root>/objects/obj-<id>.hdr    [magic: u32 LE][blksz: u32][bonus_len: u32][bonus ...]
//! ```
//!
//! Headers are rewritten atomically (write to `.tmp`, rename) so a bonus
//! update is never observed half-written. Object 1 is always the pool
//! directory, a ZAP created at store creation time.
//!
//! ## Transactions
//!
//! Mutators take a [`Tx`] carrying the TXG they belong to. The store checks
//! that TXGs never move backwards; durability barriers between TXGs (log
//! records durable before the uberblock advances) are the caller's pipeline
//! contract, not enforced here.
//!
//! ## Example
//! ```rust,no_run
//! use mos::{Mos, Tx};
//!
//! let mut mos = Mos::create("/tmp/pool").unwrap();
//! let tx = Tx::new(100);
//! let obj = mos.object_create(4096, &tx).unwrap();
//! mos.append(obj, b"hello", &tx).unwrap();
//! assert_eq!(mos.object_len(obj).unwrap(), 5);
//! ```

use byteorder::{ByteOrder, LittleEndian};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Magic number identifying object header files (ASCII "MOS1").
const HEADER_MAGIC: u32 = 0x4D4F_5331;

/// Object id of the pool directory ZAP, created with the store.
pub const DIRECTORY_OBJECT: u64 = 1;

/// Block size used for ZAP objects.
const ZAP_BLKSZ: u32 = 4096;

/// Errors surfaced by the object store.
#[derive(Debug, Error)]
pub enum MosError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The named object does not exist.
    #[error("object {0} not found")]
    NotFound(u64),

    /// A ZAP has no entry for the given key.
    #[error("zap {zap} has no entry for key {key}")]
    ZapKeyNotFound { zap: u64, key: u64 },

    /// A header or ZAP failed structural validation.
    #[error("corrupt object store: {0}")]
    Corrupt(String),

    /// The store's capacity would be exceeded by the write.
    #[error("object store capacity exhausted")]
    NoSpace,
}

/// A transaction handle stamping mutations with their TXG.
#[derive(Debug, Clone)]
pub struct Tx {
    txg: u64,
}

impl Tx {
    /// Creates a handle for the given TXG.
    #[must_use]
    pub fn new(txg: u64) -> Self {
        Self { txg }
    }

    /// The TXG this transaction belongs to.
    #[must_use]
    pub fn txg(&self) -> u64 {
        self.txg
    }
}

/// A file-backed meta object store.
pub struct Mos {
    objects_dir: PathBuf,
    next_id: u64,
    /// Total data bytes across all objects, for the capacity check.
    used: u64,
    /// Optional cap on total data bytes; writes past it fail with `NoSpace`.
    capacity: Option<u64>,
    /// Highest TXG observed on a mutation; TXGs must not move backwards.
    last_txg: u64,
}

impl std::fmt::Debug for Mos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mos")
            .field("objects_dir", &self.objects_dir)
            .field("next_id", &self.next_id)
            .field("used", &self.used)
            .field("capacity", &self.capacity)
            .field("last_txg", &self.last_txg)
            .finish()
    }
}

impl Mos {
    /// Creates a new store rooted at `root`, including the pool directory
    /// ZAP (object 1).
    pub fn create<P: AsRef<Path>>(root: P) -> Result<Self, MosError> {
        let objects_dir = root.as_ref().join("objects");
        fs::create_dir_all(&objects_dir)?;

        let mut mos = Self {
            objects_dir,
            next_id: DIRECTORY_OBJECT,
            used: 0,
            capacity: None,
            last_txg: 0,
        };
        let tx = Tx::new(0);
        let dir = mos.zap_create(&tx)?;
        if dir != DIRECTORY_OBJECT {
            return Err(MosError::Corrupt(
                "store root already contains objects".into(),
            ));
        }
        Ok(mos)
    }

    /// Opens an existing store, rebuilding the id allocator and usage
    /// counter from the objects on disk.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, MosError> {
        let objects_dir = root.as_ref().join("objects");
        let mut max_id = 0u64;
        let mut used = 0u64;

        for entry in fs::read_dir(&objects_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name
                .strip_prefix("obj-")
                .and_then(|s| s.strip_suffix(".dat"))
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            max_id = max_id.max(id);
            used += entry.metadata()?.len();
        }

        let mos = Self {
            objects_dir,
            next_id: max_id + 1,
            used,
            capacity: None,
            last_txg: 0,
        };
        if !mos.object_exists(DIRECTORY_OBJECT) {
            return Err(MosError::Corrupt("store has no directory object".into()));
        }
        Ok(mos)
    }

    /// Limits total data bytes; `None` removes the limit.
    pub fn set_capacity(&mut self, capacity: Option<u64>) {
        self.capacity = capacity;
    }

    /// Total data bytes currently stored across all objects.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.used
    }

    /// The pool directory ZAP.
    #[must_use]
    pub fn directory(&self) -> u64 {
        DIRECTORY_OBJECT
    }

    // -------------------- objects --------------------

    /// Creates a new empty object with the given block size and returns its
    /// id.
    pub fn object_create(&mut self, blksz: u32, tx: &Tx) -> Result<u64, MosError> {
        self.note_tx(tx);
        let id = self.next_id;
        self.next_id += 1;

        File::create(self.dat_path(id))?;
        self.write_header(id, blksz, &[])?;
        Ok(id)
    }

    /// Frees an object, removing its data and header.
    pub fn object_free(&mut self, id: u64, tx: &Tx) -> Result<(), MosError> {
        self.note_tx(tx);
        let len = self.object_len(id)?;
        fs::remove_file(self.dat_path(id))?;
        fs::remove_file(self.hdr_path(id))?;
        self.used -= len;
        Ok(())
    }

    /// Returns `true` if the object exists.
    #[must_use]
    pub fn object_exists(&self, id: u64) -> bool {
        self.dat_path(id).exists()
    }

    /// Length of the object's data in bytes.
    pub fn object_len(&self, id: u64) -> Result<u64, MosError> {
        let meta = fs::metadata(self.dat_path(id)).map_err(|_| MosError::NotFound(id))?;
        Ok(meta.len())
    }

    /// The object's configured block size.
    pub fn object_blksz(&self, id: u64) -> Result<u32, MosError> {
        Ok(self.read_header(id)?.0)
    }

    /// Appends bytes to the end of the object.
    pub fn append(&mut self, id: u64, bytes: &[u8], tx: &Tx) -> Result<(), MosError> {
        self.note_tx(tx);
        self.charge(bytes.len() as u64)?;
        let mut f = OpenOptions::new()
            .append(true)
            .open(self.dat_path(id))
            .map_err(|_| MosError::NotFound(id))?;
        f.write_all(bytes)?;
        f.flush()?;
        Ok(())
    }

    /// Writes bytes at an absolute offset, growing the object (zero-filled)
    /// if the offset lies past the current end.
    pub fn write_at(&mut self, id: u64, offset: u64, bytes: &[u8], tx: &Tx) -> Result<(), MosError> {
        self.note_tx(tx);
        let len = self.object_len(id)?;
        let new_len = len.max(offset + bytes.len() as u64);
        self.charge(new_len - len)?;

        let mut f = OpenOptions::new().write(true).open(self.dat_path(id))?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(bytes)?;
        f.flush()?;
        Ok(())
    }

    /// Replaces the object's contents wholesale.
    pub fn object_write(&mut self, id: u64, bytes: &[u8], tx: &Tx) -> Result<(), MosError> {
        self.note_tx(tx);
        let len = self.object_len(id)?;
        if (bytes.len() as u64) > len {
            self.charge(bytes.len() as u64 - len)?;
        } else {
            self.used -= len - bytes.len() as u64;
        }

        let mut f = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.dat_path(id))?;
        f.write_all(bytes)?;
        f.flush()?;
        Ok(())
    }

    /// Reads exactly `len` bytes at `offset`.
    pub fn read_at(&self, id: u64, offset: u64, len: usize) -> Result<Vec<u8>, MosError> {
        let mut f = File::open(self.dat_path(id)).map_err(|_| MosError::NotFound(id))?;
        f.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        f.read_exact(&mut buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                MosError::Corrupt(format!("short read of object {id} at offset {offset}"))
            } else {
                MosError::Io(e)
            }
        })?;
        Ok(buf)
    }

    /// Reads the object's entire data.
    pub fn read_all(&self, id: u64) -> Result<Vec<u8>, MosError> {
        let mut f = File::open(self.dat_path(id)).map_err(|_| MosError::NotFound(id))?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        Ok(buf)
    }

    // -------------------- bonus buffers --------------------

    /// Reads the object's bonus buffer.
    pub fn bonus_read(&self, id: u64) -> Result<Vec<u8>, MosError> {
        Ok(self.read_header(id)?.1)
    }

    /// Replaces the object's bonus buffer (atomic rewrite).
    pub fn bonus_write(&mut self, id: u64, bonus: &[u8], tx: &Tx) -> Result<(), MosError> {
        self.note_tx(tx);
        let blksz = self.object_blksz(id)?;
        self.write_header(id, blksz, bonus)
    }

    // -------------------- ZAPs --------------------

    /// Creates a new, empty ZAP object.
    pub fn zap_create(&mut self, tx: &Tx) -> Result<u64, MosError> {
        let id = self.object_create(ZAP_BLKSZ, tx)?;
        self.object_write(id, &serialize_zap(&[]), tx)?;
        Ok(id)
    }

    /// Looks up a key, failing with [`MosError::ZapKeyNotFound`] if absent.
    pub fn zap_lookup(&self, zap: u64, key: u64) -> Result<u64, MosError> {
        self.read_zap(zap)?
            .iter()
            .find(|&&(k, _)| k == key)
            .map(|&(_, v)| v)
            .ok_or(MosError::ZapKeyNotFound { zap, key })
    }

    /// Inserts a key that must not already exist.
    pub fn zap_add(&mut self, zap: u64, key: u64, value: u64, tx: &Tx) -> Result<(), MosError> {
        let mut entries = self.read_zap(zap)?;
        debug_assert!(
            !entries.iter().any(|&(k, _)| k == key),
            "zap {zap} already has key {key}"
        );
        entries.push((key, value));
        entries.sort_unstable();
        self.object_write(zap, &serialize_zap(&entries), tx)
    }

    /// Inserts or replaces a key.
    pub fn zap_update(&mut self, zap: u64, key: u64, value: u64, tx: &Tx) -> Result<(), MosError> {
        let mut entries = self.read_zap(zap)?;
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => {
                entries.push((key, value));
                entries.sort_unstable();
            }
        }
        self.object_write(zap, &serialize_zap(&entries), tx)
    }

    /// Removes a key, failing with [`MosError::ZapKeyNotFound`] if absent.
    pub fn zap_remove(&mut self, zap: u64, key: u64, tx: &Tx) -> Result<(), MosError> {
        let mut entries = self.read_zap(zap)?;
        let before = entries.len();
        entries.retain(|&(k, _)| k != key);
        if entries.len() == before {
            return Err(MosError::ZapKeyNotFound { zap, key });
        }
        self.object_write(zap, &serialize_zap(&entries), tx)
    }

    /// Returns all entries in ascending key order.
    pub fn zap_iter(&self, zap: u64) -> Result<Vec<(u64, u64)>, MosError> {
        self.read_zap(zap)
    }

    // -------------------- internals --------------------

    fn note_tx(&mut self, tx: &Tx) {
        debug_assert!(
            tx.txg >= self.last_txg,
            "txg moved backwards: {} -> {}",
            self.last_txg,
            tx.txg
        );
        self.last_txg = tx.txg;
    }

    fn charge(&mut self, bytes: u64) -> Result<(), MosError> {
        if let Some(cap) = self.capacity {
            if self.used + bytes > cap {
                return Err(MosError::NoSpace);
            }
        }
        self.used += bytes;
        Ok(())
    }

    fn dat_path(&self, id: u64) -> PathBuf {
        self.objects_dir.join(format!("obj-{id:020}.dat"))
    }

    fn hdr_path(&self, id: u64) -> PathBuf {
        self.objects_dir.join(format!("obj-{id:020}.hdr"))
    }

    fn write_header(&self, id: u64, blksz: u32, bonus: &[u8]) -> Result<(), MosError> {
        let mut buf = Vec::with_capacity(12 + bonus.len());
        buf.extend_from_slice(&HEADER_MAGIC.to_le_bytes());
        buf.extend_from_slice(&blksz.to_le_bytes());
        buf.extend_from_slice(&(bonus.len() as u32).to_le_bytes());
        buf.extend_from_slice(bonus);

        // Atomic rewrite: tmp + rename, so a crashed bonus update is never
        // half-visible.
        let path = self.hdr_path(id);
        let tmp = path.with_extension("hdr.tmp");
        let mut f = File::create(&tmp)?;
        f.write_all(&buf)?;
        f.flush()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_header(&self, id: u64) -> Result<(u32, Vec<u8>), MosError> {
        let bytes = fs::read(self.hdr_path(id)).map_err(|_| MosError::NotFound(id))?;
        if bytes.len() < 12 {
            return Err(MosError::Corrupt(format!("object {id} header truncated")));
        }
        if LittleEndian::read_u32(&bytes[0..4]) != HEADER_MAGIC {
            return Err(MosError::Corrupt(format!("object {id} header bad magic")));
        }
        let blksz = LittleEndian::read_u32(&bytes[4..8]);
        let bonus_len = LittleEndian::read_u32(&bytes[8..12]) as usize;
        if bytes.len() != 12 + bonus_len {
            return Err(MosError::Corrupt(format!(
                "object {id} header length mismatch"
            )));
        }
        Ok((blksz, bytes[12..].to_vec()))
    }

    fn read_zap(&self, zap: u64) -> Result<Vec<(u64, u64)>, MosError> {
        let bytes = self.read_all(zap)?;
        if bytes.len() < 8 {
            return Err(MosError::Corrupt(format!("zap {zap} truncated")));
        }
        let count = LittleEndian::read_u64(&bytes[0..8]) as usize;
        if bytes.len() != 8 + count * 16 {
            return Err(MosError::Corrupt(format!("zap {zap} length mismatch")));
        }
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let off = 8 + i * 16;
            entries.push((
                LittleEndian::read_u64(&bytes[off..off + 8]),
                LittleEndian::read_u64(&bytes[off + 8..off + 16]),
            ));
        }
        Ok(entries)
    }
}

fn serialize_zap(entries: &[(u64, u64)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + entries.len() * 16);
    buf.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for &(k, v) in entries {
        buf.extend_from_slice(&k.to_le_bytes());
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

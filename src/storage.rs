//! Content-addressed piece storage.
//!
//! Pieces land in a single backing file named `<hex info-hash>.tmp`, each at
//! offset `index * piece_length`. The file is created zero-filled at the
//! exact content length, so blocks can be written in any order as they
//! arrive from the swarm. A bitfield tracks which pieces currently hash
//! correctly; it is rebuilt by a full validation pass on open, which is what
//! makes resumed downloads work.
//!
//! The same module owns the `.meta` cache: the raw info-dict bytes saved
//! after a magnet bootstrap so the next run can skip the metadata exchange.
use crate::bitfield::Bitfield;
use crate::torrent::metainfo::{sha1, Metainfo};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece {index} range {begin}+{size} exceeds piece size {piece_size}")]
    OutOfRange {
        index: usize,
        begin: u64,
        size: u64,
        piece_size: u64,
    },

    #[error("stored bytes do not hash to {0}")]
    HashMismatch(String),

    #[error("metainfo error: {0}")]
    Torrent(#[from] crate::torrent::TorrentError),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[derive(Debug)]
pub struct Storage {
    file: File,
    path: PathBuf,
    meta: Arc<Metainfo>,
    bits: Bitfield,
}

impl Storage {
    /// Opens (or creates) the backing file for `meta` under `dir` and
    /// validates every piece already present.
    pub fn open(meta: Arc<Metainfo>, dir: &Path) -> StorageResult<Storage> {
        let path = dir.join(format!("{}.tmp", hex::encode(meta.info_hash)));
        info!(name = %meta.name, path = %path.display(), "opening storage");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        // Exact length: zero-fills a fresh or short file, trims anything
        // past the content end. Offsets inside are never disturbed.
        file.set_len(meta.total)?;

        let mut storage = Storage {
            file,
            path,
            bits: Bitfield::new(meta.num_pieces()),
            meta,
        };
        let missing: Vec<usize> = (0..storage.meta.num_pieces()).collect();
        storage.validate(&missing)?;
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bits(&self) -> &Bitfield {
        &self.bits
    }

    pub fn is_complete(&self) -> bool {
        self.bits.all()
    }

    /// Bytes still missing, as reported to trackers in the `left` field.
    pub fn bytes_left(&self) -> u64 {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, have)| !have)
            .map(|(i, _)| self.meta.piece_size(i))
            .sum()
    }

    fn check_range(&self, index: usize, begin: u64, size: u64) -> StorageResult<()> {
        let piece_size = if index < self.meta.num_pieces() {
            self.meta.piece_size(index)
        } else {
            0
        };
        if begin + size > piece_size {
            return Err(StorageError::OutOfRange {
                index,
                begin,
                size,
                piece_size,
            });
        }
        Ok(())
    }

    /// Reads `size` bytes of piece `index` starting at `begin`.
    pub fn read(&mut self, index: usize, begin: u64, size: u64) -> StorageResult<Vec<u8>> {
        self.check_range(index, begin, size)?;
        self.file
            .seek(SeekFrom::Start(index as u64 * self.meta.piece_length + begin))?;
        let mut data = vec![0u8; size as usize];
        self.file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Reads the whole of piece `index`.
    pub fn read_piece(&mut self, index: usize) -> StorageResult<Vec<u8>> {
        let size = self.meta.piece_size(index);
        self.read(index, 0, size)
    }

    /// Writes one block at its natural offset. No hashing happens here; the
    /// caller validates the piece once all of its blocks have arrived.
    pub fn write(&mut self, index: usize, begin: u64, data: &[u8]) -> StorageResult<()> {
        self.check_range(index, begin, data.len() as u64)?;
        self.file
            .seek(SeekFrom::Start(index as u64 * self.meta.piece_length + begin))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Re-reads and re-hashes the listed pieces, setting or clearing each
    /// bit to match. Returns how many of them validated. Idempotent when
    /// nothing was written in between.
    pub fn validate(&mut self, indices: &[usize]) -> StorageResult<usize> {
        let mut validated = 0;
        for &index in indices {
            let data = self.read_piece(index)?;
            if sha1(&data) == self.meta.hashes[index] {
                self.bits.set(index);
                validated += 1;
                debug!(piece = index, "validated piece");
            } else {
                self.bits.clear(index);
            }
        }
        info!(
            have = self.bits.count(),
            total = self.bits.len(),
            "storage bitmap updated"
        );
        Ok(validated)
    }
}

fn meta_cache_path(info_hash: &[u8; 20], dir: &Path) -> PathBuf {
    dir.join(format!("{}.meta", hex::encode(info_hash)))
}

/// Loads the cached info-dict for `info_hash`, verifying its digest before
/// trusting it. A missing file surfaces as the I/O error, a corrupt one as
/// `HashMismatch`; callers treat both as "no cache".
pub fn load_cached_info(info_hash: &[u8; 20], dir: &Path) -> StorageResult<Metainfo> {
    let bytes = std::fs::read(meta_cache_path(info_hash, dir))?;
    if sha1(&bytes) != *info_hash {
        return Err(StorageError::HashMismatch(hex::encode(info_hash)));
    }
    Ok(Metainfo::from_info_bytes(&bytes)?)
}

/// Persists info-dict bytes fetched from the swarm so later runs skip the
/// metadata exchange.
pub fn save_cached_info(info_hash: &[u8; 20], bytes: &[u8], dir: &Path) -> StorageResult<()> {
    let path = meta_cache_path(info_hash, dir);
    info!(path = %path.display(), "caching metadata");
    std::fs::write(path, bytes)?;
    Ok(())
}

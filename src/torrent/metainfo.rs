//! Content manifest parsing.
//!
//! A [`Metainfo`] is everything the engine needs to identify and verify one
//! single-file torrent: the info-hash, the per-piece SHA-1 manifest, the
//! uniform piece length, and the total content length. It can be built from
//! a whole .torrent file or from a raw info-dict encoding (the form the
//! metadata extension and the on-disk cache carry).
use crate::bencode::{decoder, encoder, BencodeValue};

use super::TorrentError;
use super::TorrentResult;
use sha1::Digest;
use sha1::Sha1;
use std::path::Path;

const HASH_SIZE: usize = 20;

#[derive(Debug, PartialEq, Clone)]
pub struct Metainfo {
    pub name: String,
    pub info_hash: [u8; 20],
    pub piece_length: u64,
    pub hashes: Vec<[u8; 20]>,
    pub total: u64,
}

/// A parsed .torrent file: the manifest plus the tracker it names.
#[derive(Debug, PartialEq, Clone)]
pub struct TorrentFile {
    pub announce: Option<String>,
    pub meta: Metainfo,
}

/**
Parses the concatenated SHA-1 hashes from the `pieces` string.

# Torrent Protocol Context:
The `pieces` key within the `info` dictionary is a single byte string that
is a concatenation of 20-byte SHA-1 hashes, one per piece. This function
breaks that long string into individual 20-byte hash arrays. The order of
these hashes is crucial as it corresponds directly to the piece index.

# How it works:
1. Validates that the blob length is a multiple of 20.
2. Copies each 20-byte chunk into a fixed-size `[u8; 20]` array.
3. Collects these arrays into a `Vec<[u8; 20]>`.
*/
#[tracing::instrument(level = "trace", skip(pieces_bytes))]
fn parse_pieces(pieces_bytes: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if pieces_bytes.len() % HASH_SIZE != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }
    let mut hashes = Vec::with_capacity(pieces_bytes.len() / HASH_SIZE);
    for chunk in pieces_bytes.chunks_exact(HASH_SIZE) {
        let mut hash_array = [0u8; HASH_SIZE];
        hash_array.copy_from_slice(chunk);
        hashes.push(hash_array);
    }
    Ok(hashes)
}

/// SHA-1 of arbitrary bytes as a fixed 20-byte array. The identity of both
/// pieces and info dictionaries.
pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

impl Metainfo {
    /**
    Builds a manifest from the bencode encoding of an info dictionary.

    This is the byte sequence whose SHA-1 is the info-hash, so the hash
    comes straight from the input. Used for the `.meta` cache and for
    metadata fetched from peers; `TorrentFile::from_bytes` funnels through
    here as well.

    # How it works:
    1. Hashes the input bytes to obtain the info-hash.
    2. Decodes the dictionary and extracts `name`, `piece length`,
       `pieces`, and `length`.
    3. Validates that `ceil(length / piece_length)` equals the number of
       piece hashes.
    */
    pub fn from_info_bytes(bytes: &[u8]) -> TorrentResult<Metainfo> {
        let info_hash = sha1(bytes);
        let info = decoder::decode(bytes)?;

        // Step 1: name (required, UTF-8)
        let name = match info.find(b"name") {
            Some(BencodeValue::String(s)) => String::from_utf8(s.clone()).map_err(|e| {
                TorrentError::InvalidFormat(format!("Invalid name (not UTF-8): {}", e))
            })?,
            _ => return Err(TorrentError::MissingField("name".to_string())),
        };

        // Step 2: piece length (required, positive)
        let piece_length = match info.find(b"piece length") {
            Some(BencodeValue::Integer(i)) if *i > 0 => *i as u64,
            Some(BencodeValue::Integer(_)) => {
                return Err(TorrentError::InvalidFormat(
                    "piece length must be positive".to_string(),
                ));
            }
            _ => return Err(TorrentError::MissingField("piece length".to_string())),
        };

        // Step 3: piece hashes (required)
        let hashes = match info.find(b"pieces") {
            Some(BencodeValue::String(s)) => parse_pieces(s)?,
            _ => return Err(TorrentError::MissingField("pieces".to_string())),
        };

        // Step 4: total length (required; only single-file torrents are handled)
        let total = match info.find(b"length") {
            Some(BencodeValue::Integer(i)) if *i >= 0 => *i as u64,
            Some(BencodeValue::Integer(_)) => {
                return Err(TorrentError::InvalidFormat(
                    "length must not be negative".to_string(),
                ));
            }
            _ => return Err(TorrentError::MissingField("length".to_string())),
        };

        // Step 5: the piece arithmetic must close. ceil(total / piece_length)
        // pieces of piece_length bytes, the last possibly short.
        let expected = total.div_ceil(piece_length);
        if expected != hashes.len() as u64 {
            return Err(TorrentError::InvalidFormat(format!(
                "{} bytes in {}-byte pieces needs {} hashes, found {}",
                total,
                piece_length,
                expected,
                hashes.len()
            )));
        }

        Ok(Metainfo {
            name,
            info_hash,
            piece_length,
            hashes,
            total,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.hashes.len()
    }

    /// The size of piece `index`: `piece_length` for every piece except the
    /// last, which covers whatever remains of `total`.
    pub fn piece_size(&self, index: usize) -> u64 {
        debug_assert!(index < self.num_pieces());
        if index < self.num_pieces() - 1 {
            self.piece_length
        } else {
            self.total - self.piece_length * (self.num_pieces() as u64 - 1)
        }
    }
}

impl TorrentFile {
    /**
    Parses a whole .torrent file.

    # How it works:
    1. Decodes the top-level bencode dictionary.
    2. Re-encodes the `info` value and hands the bytes to
       `Metainfo::from_info_bytes`. The codec preserves dictionary key
       order, so the re-encoding is byte-identical to the slice of the
       original file and the derived info-hash matches what the swarm uses.
    3. Lifts the optional `announce` string alongside.
    */
    pub fn from_bytes(bytes: &[u8]) -> TorrentResult<TorrentFile> {
        let root = decoder::decode(bytes)?;

        let announce = match root.find(b"announce") {
            Some(BencodeValue::String(s)) => Some(String::from_utf8(s.clone()).map_err(|e| {
                TorrentError::InvalidFormat(format!("Invalid announce URL (not UTF-8): {}", e))
            })?),
            _ => None,
        };

        let info = root
            .find(b"info")
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
        let info_bytes = encoder::encode_to_vec(info)?;
        let meta = Metainfo::from_info_bytes(&info_bytes)?;

        Ok(TorrentFile { announce, meta })
    }

    pub fn from_path(path: &Path) -> TorrentResult<TorrentFile> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encoder::encode_to_vec;

    fn info_value(name: &str, piece_length: i64, total: i64, pieces: &[u8]) -> BencodeValue {
        BencodeValue::Dict(vec![
            (
                b"length".to_vec(),
                BencodeValue::Integer(total),
            ),
            (
                b"name".to_vec(),
                BencodeValue::String(name.as_bytes().to_vec()),
            ),
            (
                b"piece length".to_vec(),
                BencodeValue::Integer(piece_length),
            ),
            (b"pieces".to_vec(), BencodeValue::String(pieces.to_vec())),
        ])
    }

    fn sample_torrent() -> Vec<u8> {
        // 10 bytes in 4-byte pieces: three hashes, the last piece 2 bytes.
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&sha1(b"abcd"));
        pieces.extend_from_slice(&sha1(b"efgh"));
        pieces.extend_from_slice(&sha1(b"ij"));
        let root = BencodeValue::Dict(vec![
            (
                b"announce".to_vec(),
                BencodeValue::String(b"udp://tracker.example:6969".to_vec()),
            ),
            (b"info".to_vec(), info_value("sample.bin", 4, 10, &pieces)),
        ]);
        encode_to_vec(&root).unwrap()
    }

    #[test]
    fn parses_torrent_and_derives_info_hash() {
        let bytes = sample_torrent();
        let parsed = TorrentFile::from_bytes(&bytes).unwrap();
        assert_eq!(
            parsed.announce.as_deref(),
            Some("udp://tracker.example:6969")
        );
        assert_eq!(parsed.meta.name, "sample.bin");
        assert_eq!(parsed.meta.piece_length, 4);
        assert_eq!(parsed.meta.total, 10);
        assert_eq!(parsed.meta.num_pieces(), 3);

        // The info-hash must equal the SHA-1 of the info slice exactly as
        // it sits inside the file.
        let info_bytes = encode_to_vec(
            &decoder::decode(&bytes).unwrap().find(b"info").unwrap().clone(),
        )
        .unwrap();
        assert_eq!(parsed.meta.info_hash, sha1(&info_bytes));
    }

    #[test]
    fn piece_size_shortens_the_last_piece() {
        let meta = TorrentFile::from_bytes(&sample_torrent()).unwrap().meta;
        assert_eq!(meta.piece_size(0), 4);
        assert_eq!(meta.piece_size(1), 4);
        assert_eq!(meta.piece_size(2), 2);
    }

    #[test]
    fn rejects_ragged_piece_blob() {
        let info = info_value("x", 4, 10, &[0u8; 41]);
        let bytes = encode_to_vec(&info).unwrap();
        assert!(matches!(
            Metainfo::from_info_bytes(&bytes),
            Err(TorrentError::InvalidPiecesHashLength)
        ));
    }

    #[test]
    fn rejects_hash_count_mismatch() {
        // 10 bytes at piece length 4 needs 3 hashes, not 2.
        let info = info_value("x", 4, 10, &[0u8; 40]);
        let bytes = encode_to_vec(&info).unwrap();
        assert!(matches!(
            Metainfo::from_info_bytes(&bytes),
            Err(TorrentError::InvalidFormat(_))
        ));
    }

    #[test]
    fn rejects_missing_fields() {
        let info = BencodeValue::Dict(vec![(
            b"name".to_vec(),
            BencodeValue::String(b"x".to_vec()),
        )]);
        let bytes = encode_to_vec(&info).unwrap();
        assert!(matches!(
            Metainfo::from_info_bytes(&bytes),
            Err(TorrentError::MissingField(_))
        ));
    }
}

//! This module implements the BitTorrent peer handshake protocol.
//!
//! The handshake is the first message exchanged between two peers. It verifies
//! that both peers are participating in the same torrent (via info_hash) and
//! establishes basic protocol compatibility.
use super::PeerError;
use super::PeerId;
use super::PeerResult;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::instrument;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// Reserved-field bit announcing extension-protocol support.
pub const EXTENSION_PROTOCOL_BIT: u8 = 20;

/** Represents a BitTorrent handshake message.

A handshake is the first message exchanged between peers and contains:
- Protocol identifier ("BitTorrent protocol")
- Reserved bytes, read as a 64-bit field of extension flags
- Info hash identifying the torrent
- Peer ID identifying the client */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
}

impl Handshake {
    /// A plain handshake with no extension flags set.
    pub fn new(info_hash: [u8; 20], peer_id: PeerId) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// A handshake advertising extension-protocol support, used by the
    /// metadata bootstrap.
    pub fn with_extensions(info_hash: [u8; 20], peer_id: PeerId) -> Self {
        let mut handshake = Self::new(info_hash, peer_id);
        handshake.set_reserved_bit(EXTENSION_PROTOCOL_BIT);
        handshake
    }

    // Bit n of the 64-bit reserved field: byte 7 - n/8, in-byte position
    // 1 << (n % 8). Bit 20 is reserved[5] & 0x10.
    fn reserved_mask(bit: u8) -> (usize, u8) {
        debug_assert!(bit < 64);
        (7 - (bit / 8) as usize, 1 << (bit % 8))
    }

    fn set_reserved_bit(&mut self, bit: u8) {
        let (byte, mask) = Self::reserved_mask(bit);
        self.reserved[byte] |= mask;
    }

    fn reserved_bit(&self, bit: u8) -> bool {
        let (byte, mask) = Self::reserved_mask(bit);
        self.reserved[byte] & mask != 0
    }

    /// Whether the remote side speaks the extension protocol.
    pub fn supports_extensions(&self) -> bool {
        self.reserved_bit(EXTENSION_PROTOCOL_BIT)
    }

    /** Serializes the handshake into a 68-byte array.

    The serialized format is:
    - 1 byte: protocol string length (19)
    - 19 bytes: protocol string ("BitTorrent protocol")
    - 8 bytes: reserved extension flags
    - 20 bytes: info hash
    - 20 bytes: peer ID */
    #[instrument(level = "trace")]
    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /**
    Asynchronously reads and parses a handshake from a peer stream.

    Reads exactly 68 bytes and validates the protocol length and string.

    # Errors
    - `PeerError::ConnectionClosed` if the stream ends mid-handshake.
    - `PeerError::Protocol` if the protocol length is not 19 or the
      protocol string is not "BitTorrent protocol".
    */
    #[instrument(level = "trace", skip(stream))]
    pub async fn read<S: AsyncRead + Unpin>(stream: &mut S) -> PeerResult<Self> {
        // Step 1: Read the first byte (protocol length) and validate it.
        let mut length_buf = [0u8; 1];
        stream
            .read_exact(&mut length_buf)
            .await
            .map_err(PeerError::from_io)?;
        if length_buf[0] as usize != PROTOCOL.len() {
            return Err(PeerError::Protocol(format!(
                "invalid protocol length: {}",
                length_buf[0]
            )));
        }

        // Step 2: Read the remaining 67 bytes of the handshake.
        let mut buf = [0u8; 67];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(PeerError::from_io)?;

        // Step 3: Validate the protocol string.
        if &buf[0..19] != PROTOCOL {
            return Err(PeerError::Protocol(format!(
                "invalid protocol string: {:?}",
                &buf[0..19]
            )));
        }

        // Step 4: Extract reserved bytes, info_hash, and peer_id.
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[19..27]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[27..47]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[47..67]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /** Validates that this handshake's info hash matches the expected value.

    The session is aborted on mismatch; a peer answering for a different
    torrent has nothing for us. */
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> PeerResult<()> {
        if self.info_hash != *expected_info_hash {
            return Err(PeerError::Protocol(format!(
                "info hash mismatch: got {}, expected {}",
                hex::encode(self.info_hash),
                hex::encode(expected_info_hash)
            )));
        }
        Ok(())
    }
}

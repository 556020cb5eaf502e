//! Peer-wire protocol: handshake, message codec, extension sub-protocol,
//! and the per-connection session state machines.
use rand::Rng;
use thiserror::Error;

pub mod extension;
pub mod handshake;
pub mod message;
pub mod session;

/// The 20-byte identifier a peer presents in its handshake and to trackers.
pub type PeerId = [u8; 20];

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the connection")]
    ConnectionClosed,

    #[error("socket operation timed out")]
    Timeout,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("bencode error in extension payload: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;

impl PeerError {
    /// Folds an I/O error into the closed-connection variant when that is
    /// what it means, so session logs read sensibly.
    pub(crate) fn from_io(e: std::io::Error) -> PeerError {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => PeerError::ConnectionClosed,
            _ => PeerError::Io(e),
        }
    }
}

/// Generates a unique peer ID for this client.
///
/// A 9-byte client prefix ("-RL0001-", RL = Rust leech) followed by 11
/// random bytes to ensure uniqueness across runs.
pub fn generate_peer_id() -> PeerId {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RL0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[prefix.len()..]);
    peer_id
}

//! Torrent descriptor parsing and error handling logic.
//!
//! This module provides types and error handling for working with .torrent
//! files and magnet links, including parsing, validation, and error
//! reporting.
use thiserror::Error;
pub mod magnet;
pub mod metainfo;

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("Invalid torrent format: {0}")]
    InvalidFormat(String),

    #[error("Missing or invalid field: {0}")]
    MissingField(String),

    #[error("Invalid pieces hash length")]
    InvalidPiecesHashLength,

    #[error("Unsupported tracker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Url parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Result type for torrent operations derived from `std::result`
pub type TorrentResult<T> = std::result::Result<T, TorrentError>;

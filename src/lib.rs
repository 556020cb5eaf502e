//! Library root for rs-leech.
//!
//! A leeching BitTorrent engine: bencode and peer-wire codecs, UDP tracker
//! discovery, concurrent peer sessions with global block scheduling, and
//! hash-validated piece storage, plus the ut_metadata bootstrap for magnet
//! links.
pub mod bencode;
pub mod bitfield;
pub mod peer;
pub mod scheduler;
pub mod storage;
pub mod swarm;
pub mod torrent;
pub mod tracker;

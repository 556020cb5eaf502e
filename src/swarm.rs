//! Swarm supervision.
//!
//! The supervisor turns tracker announces into a fleet of peer session
//! tasks and harvests their results. The first session to report success
//! cancels the rest. When every session has ended without success the
//! announce is re-issued, since the swarm may have changed.
//!
//! Two modes share this shape: torrent mode downloads pieces until storage
//! is complete, metadata mode fetches the info-dict for a magnet link.
use crate::peer::session::{MetadataSession, PeerSession};
use crate::peer::{PeerError, PeerId};
use crate::scheduler::Scheduler;
use crate::storage::{self, Storage, StorageError};
use crate::torrent::metainfo::Metainfo;
use crate::tracker::{self, Announce, AnnounceEvent};

use anyhow::Context;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Peers asked of the tracker per announce.
const NUM_WANT: i32 = 50;

/// Pause before re-announcing when the tracker had no peers for us.
const REANNOUNCE_DELAY: Duration = Duration::from_secs(5);

/**
Downloads the torrent described by `meta`, returning the path of the
completed backing file.

# How it works:
1. Opens storage, which validates whatever an earlier run left behind; a
   complete file returns immediately.
2. Announces to the tracker list and spawns one [`PeerSession`] task per
   distinct peer address.
3. Waits on the sessions. The first to return the completion sentinel
   aborts the others and wins. Fatal storage failures abort the download;
   any other session error just thins the swarm.
4. When all sessions end without completion, re-announces and spawns a
   fresh fleet.
*/
pub async fn download(
    meta: Arc<Metainfo>,
    trackers: &[String],
    our_id: PeerId,
    port: u16,
    dir: &Path,
) -> anyhow::Result<PathBuf> {
    let storage = Storage::open(meta.clone(), dir).context("opening storage")?;
    let path = storage.path().to_path_buf();
    if storage.is_complete() {
        info!(path = %path.display(), "file already complete");
        return Ok(path);
    }

    let scheduler = Arc::new(Mutex::new(Scheduler::new(&meta, storage.bits())));
    let storage = Arc::new(Mutex::new(storage));
    let mut first_announce = true;

    loop {
        let left = storage.lock().unwrap().bytes_left();
        let announce = Announce {
            info_hash: meta.info_hash,
            peer_id: our_id,
            downloaded: meta.total - left,
            left,
            uploaded: 0,
            event: if first_announce {
                AnnounceEvent::Started
            } else {
                AnnounceEvent::None
            },
            port,
            num_want: NUM_WANT,
        };
        first_announce = false;

        let response = tracker::fetch_peers(trackers, &announce)
            .await
            .context("peer discovery failed")?;

        let mut seen: HashSet<SocketAddr> = HashSet::new();
        let mut sessions: JoinSet<(SocketAddr, Result<(), PeerError>)> = JoinSet::new();
        for addr in response.peers {
            if !seen.insert(addr) {
                continue;
            }
            let session = PeerSession::new(
                addr,
                our_id,
                meta.clone(),
                storage.clone(),
                scheduler.clone(),
            );
            sessions.spawn(async move { (addr, session.run().await) });
        }
        info!(peers = sessions.len(), "swarm spawned");

        if sessions.is_empty() {
            warn!("tracker returned no peers, re-announcing shortly");
            tokio::time::sleep(REANNOUNCE_DELAY).await;
            continue;
        }

        while let Some(joined) = sessions.join_next().await {
            match joined {
                Ok((addr, Ok(()))) => {
                    info!(%addr, "download complete, cancelling remaining sessions");
                    sessions.abort_all();
                    while sessions.join_next().await.is_some() {}
                    return Ok(path);
                }
                Ok((addr, Err(e))) => {
                    if matches!(&e, PeerError::Storage(StorageError::Io(_))) {
                        return Err(anyhow::Error::new(e).context("fatal storage failure"));
                    }
                    debug!(%addr, %e, "peer session ended");
                }
                Err(join_error) => {
                    if !join_error.is_cancelled() {
                        warn!(%join_error, "peer session task failed");
                    }
                }
            }
        }
        info!("swarm drained without completion, re-announcing");
    }
}

/**
Resolves a magnet link's info-hash to a full [`Metainfo`].

The `.meta` cache is consulted first; its digest check makes a stale or
corrupt cache identical to an absent one. Otherwise metadata-mode sessions
are spawned against the swarm until one of them returns info-dict bytes
hashing to `info_hash`, which are cached for the next run.
*/
pub async fn fetch_metadata(
    info_hash: [u8; 20],
    trackers: &[String],
    our_id: PeerId,
    port: u16,
    dir: &Path,
) -> anyhow::Result<Metainfo> {
    match storage::load_cached_info(&info_hash, dir) {
        Ok(meta) => {
            info!(name = %meta.name, "using cached metadata");
            return Ok(meta);
        }
        Err(e) => debug!(%e, "no usable metadata cache"),
    }

    loop {
        let announce = Announce {
            info_hash,
            peer_id: our_id,
            downloaded: 0,
            left: 0,
            uploaded: 0,
            event: AnnounceEvent::None,
            port,
            num_want: NUM_WANT,
        };
        let response = tracker::fetch_peers(trackers, &announce)
            .await
            .context("peer discovery failed")?;

        let mut seen: HashSet<SocketAddr> = HashSet::new();
        let mut sessions: JoinSet<(SocketAddr, Result<Vec<u8>, PeerError>)> = JoinSet::new();
        for addr in response.peers {
            if !seen.insert(addr) {
                continue;
            }
            let session = MetadataSession::new(addr, our_id, info_hash);
            sessions.spawn(async move { (addr, session.run().await) });
        }
        info!(peers = sessions.len(), "metadata swarm spawned");

        if sessions.is_empty() {
            warn!("tracker returned no peers, re-announcing shortly");
            tokio::time::sleep(REANNOUNCE_DELAY).await;
            continue;
        }

        while let Some(joined) = sessions.join_next().await {
            match joined {
                Ok((addr, Ok(bytes))) => {
                    info!(%addr, bytes = bytes.len(), "metadata fetched, cancelling remaining sessions");
                    sessions.abort_all();
                    while sessions.join_next().await.is_some() {}

                    storage::save_cached_info(&info_hash, &bytes, dir)
                        .context("caching metadata")?;
                    return Metainfo::from_info_bytes(&bytes)
                        .context("metadata from swarm did not parse");
                }
                Ok((addr, Err(e))) => debug!(%addr, %e, "metadata session ended"),
                Err(join_error) => {
                    if !join_error.is_cancelled() {
                        warn!(%join_error, "metadata session task failed");
                    }
                }
            }
        }
        info!("no peer served metadata, re-announcing");
    }
}

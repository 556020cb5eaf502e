//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements communication with UDP trackers (BEP 15):
//! - The connect transaction that establishes a connection id
//! - Announce requests and responses with compact peer records
//! - Retry by reconnecting, and walking a list of tracker URLs
//!
//! Used by the client to discover peers for a torrent.
use crate::peer::PeerId;
use crate::torrent::magnet::parse_tracker_url;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Magic constant opening every connect request, see BEP 15.
const PROTOCOL_MAGIC: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

/// Applied to every receive on the tracker socket.
const TRACKER_TIMEOUT: Duration = Duration::from_secs(10);

/// Trackers answer in a single datagram.
const MAX_PACKET_SIZE: usize = 1 << 16;

/// Reconnect-and-retry attempts per tracker before moving on.
const ATTEMPTS_PER_TRACKER: u32 = 2;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tracker protocol error: {0}")]
    Protocol(String),

    #[error("tracker did not answer in time")]
    Timeout,

    #[error("no usable tracker in the announce list")]
    AllTrackersFailed,
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// Announce progress events, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    None = 0,
    Completed = 1,
    Started = 2,
    Stopped = 3,
}

/// Contains the parameters for a tracker announce request.
#[derive(Debug, Clone)]
pub struct Announce {
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: AnnounceEvent,
    pub port: u16,
    /// Peers wanted from the tracker; -1 leaves it to the tracker.
    pub num_want: i32,
}

/// Contains the parsed response from a tracker.
#[derive(Debug, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<SocketAddr>,
}

/// A client communicating with one UDP tracker. The connection id obtained
/// by [`UdpTracker::connect`] authorises announces for the session.
#[derive(Debug)]
pub struct UdpTracker {
    socket: UdpSocket,
    connection_id: u64,
}

impl UdpTracker {
    /**
    Binds an ephemeral socket, points it at the tracker, and runs the
    connect transaction.

    # How it works:
    1. Sends the 16-byte connect request: protocol magic, action 0, and a
       random transaction id.
    2. The response must echo action 0 and the same transaction id;
       anything else is a protocol error.
    3. The returned 64-bit connection id is kept for later announces.
    */
    pub async fn connect(host: &str, port: u16) -> TrackerResult<UdpTracker> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((host, port)).await?;
        debug!(host, port, "connected to tracker");

        let mut tracker = UdpTracker {
            socket,
            connection_id: 0,
        };

        let transaction_id = rand::rng().random::<u32>();
        let mut packet = Vec::with_capacity(16);
        packet.write_u64::<BigEndian>(PROTOCOL_MAGIC)?;
        packet.write_u32::<BigEndian>(ACTION_CONNECT)?;
        packet.write_u32::<BigEndian>(transaction_id)?;

        let response = tracker.send_recv(&packet).await?;
        let mut cursor = Cursor::new(response.as_slice());
        let action = read_u32(&mut cursor)?;
        let echoed = read_u32(&mut cursor)?;
        verify_header(ACTION_CONNECT, action, transaction_id, echoed)?;
        tracker.connection_id = read_u64(&mut cursor)?;
        debug!(connection_id = tracker.connection_id, "tracker connection established");
        Ok(tracker)
    }

    /**
    Sends an announce request and parses the peer list out of the response.

    The request carries the progress counters and wants; the response is
    the announce header followed by a greedy run of 6-byte compact peer
    records (IPv4 address and port). An empty run is a valid answer.
    */
    #[tracing::instrument(skip(self, announce), level = "debug")]
    pub async fn announce(&self, announce: &Announce) -> TrackerResult<AnnounceResponse> {
        let transaction_id = rand::rng().random::<u32>();
        let mut packet = Vec::with_capacity(98);
        packet.write_u64::<BigEndian>(self.connection_id)?;
        packet.write_u32::<BigEndian>(ACTION_ANNOUNCE)?;
        packet.write_u32::<BigEndian>(transaction_id)?;
        packet.extend_from_slice(&announce.info_hash);
        packet.extend_from_slice(&announce.peer_id);
        packet.write_u64::<BigEndian>(announce.downloaded)?;
        packet.write_u64::<BigEndian>(announce.left)?;
        packet.write_u64::<BigEndian>(announce.uploaded)?;
        packet.write_u32::<BigEndian>(announce.event as u32)?;
        packet.write_u32::<BigEndian>(0)?; // ip: let the tracker use the source address
        packet.write_u32::<BigEndian>(rand::rng().random::<u32>())?; // key
        packet.write_i32::<BigEndian>(announce.num_want)?;
        packet.write_u16::<BigEndian>(announce.port)?;

        let response = self.send_recv(&packet).await?;
        let mut cursor = Cursor::new(response.as_slice());
        let action = read_u32(&mut cursor)?;
        let echoed = read_u32(&mut cursor)?;
        verify_header(ACTION_ANNOUNCE, action, transaction_id, echoed)?;

        let interval = read_u32(&mut cursor)?;
        let leechers = read_u32(&mut cursor)?;
        let seeders = read_u32(&mut cursor)?;

        let mut peers = Vec::new();
        let remaining = &response[cursor.position() as usize..];
        for record in remaining.chunks_exact(6) {
            let ip = Ipv4Addr::new(record[0], record[1], record[2], record[3]);
            let port = u16::from_be_bytes([record[4], record[5]]);
            peers.push(SocketAddr::new(IpAddr::V4(ip), port));
        }

        info!(
            peers = peers.len(),
            interval, leechers, seeders, "announce answered"
        );
        Ok(AnnounceResponse {
            interval,
            leechers,
            seeders,
            peers,
        })
    }

    async fn send_recv(&self, packet: &[u8]) -> TrackerResult<Vec<u8>> {
        self.socket.send(packet).await?;
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let received = timeout(TRACKER_TIMEOUT, self.socket.recv(&mut buf))
            .await
            .map_err(|_| TrackerError::Timeout)??;
        buf.truncate(received);
        Ok(buf)
    }
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> TrackerResult<u32> {
    cursor
        .read_u32::<BigEndian>()
        .map_err(|_| TrackerError::Protocol("response truncated".to_string()))
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> TrackerResult<u64> {
    cursor
        .read_u64::<BigEndian>()
        .map_err(|_| TrackerError::Protocol("response truncated".to_string()))
}

fn verify_header(
    expected_action: u32,
    action: u32,
    transaction_id: u32,
    echoed: u32,
) -> TrackerResult<()> {
    if echoed != transaction_id {
        return Err(TrackerError::Protocol(format!(
            "transaction id mismatch: sent {transaction_id}, got {echoed}"
        )));
    }
    if action != expected_action {
        return Err(TrackerError::Protocol(format!(
            "unexpected action {action}, wanted {expected_action}"
        )));
    }
    Ok(())
}

/**
Walks the tracker list until one announce succeeds.

# How it works:
1. Tracker URLs that are not `udp://host:port` are reported and skipped.
2. Each usable tracker gets a bounded number of attempts; a timeout or
   socket error triggers a fresh connect transaction, since connection ids
   expire server-side.
3. The first successful announce wins, peer list empty or not.
4. `AllTrackersFailed` only when the whole list is exhausted.
*/
pub async fn fetch_peers(trackers: &[String], announce: &Announce) -> TrackerResult<AnnounceResponse> {
    for url in trackers {
        let (host, port) = match parse_tracker_url(url) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(%url, %e, "skipping tracker");
                continue;
            }
        };
        for attempt in 1..=ATTEMPTS_PER_TRACKER {
            let result = async {
                let tracker = UdpTracker::connect(&host, port).await?;
                tracker.announce(announce).await
            }
            .await;
            match result {
                Ok(response) => return Ok(response),
                Err(e) => warn!(%url, attempt, %e, "tracker announce failed"),
            }
        }
    }
    Err(TrackerError::AllTrackersFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A scripted tracker on a loopback socket: answers one connect and one
    /// announce with fixed values.
    async fn stub_tracker(connection_id: u64, peers: Vec<(Ipv4Addr, u16)>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];

            // Connect round.
            let (n, from) = socket.recv_from(&mut buf).await.unwrap();
            let mut cursor = Cursor::new(&buf[..n]);
            assert_eq!(cursor.read_u64::<BigEndian>().unwrap(), PROTOCOL_MAGIC);
            assert_eq!(cursor.read_u32::<BigEndian>().unwrap(), ACTION_CONNECT);
            let tx = cursor.read_u32::<BigEndian>().unwrap();
            let mut reply = Vec::new();
            reply.write_u32::<BigEndian>(ACTION_CONNECT).unwrap();
            reply.write_u32::<BigEndian>(tx).unwrap();
            reply.write_u64::<BigEndian>(connection_id).unwrap();
            socket.send_to(&reply, from).await.unwrap();

            // Announce round.
            let (n, from) = socket.recv_from(&mut buf).await.unwrap();
            let mut cursor = Cursor::new(&buf[..n]);
            assert_eq!(cursor.read_u64::<BigEndian>().unwrap(), connection_id);
            assert_eq!(cursor.read_u32::<BigEndian>().unwrap(), ACTION_ANNOUNCE);
            let tx = cursor.read_u32::<BigEndian>().unwrap();
            let mut reply = Vec::new();
            reply.write_u32::<BigEndian>(ACTION_ANNOUNCE).unwrap();
            reply.write_u32::<BigEndian>(tx).unwrap();
            reply.write_u32::<BigEndian>(1800).unwrap(); // interval
            reply.write_u32::<BigEndian>(1).unwrap(); // leechers
            reply.write_u32::<BigEndian>(2).unwrap(); // seeders
            for (ip, port) in peers {
                reply.extend_from_slice(&ip.octets());
                reply.write_u16::<BigEndian>(port).unwrap();
            }
            socket.send_to(&reply, from).await.unwrap();
        });
        addr
    }

    fn announce_for(info_hash: [u8; 20]) -> Announce {
        Announce {
            info_hash,
            peer_id: [2u8; 20],
            downloaded: 0,
            left: 1024,
            uploaded: 0,
            event: AnnounceEvent::Started,
            port: 6881,
            num_want: 50,
        }
    }

    #[tokio::test]
    async fn connect_then_announce_yields_the_peer_list() {
        let addr = stub_tracker(
            0xDEADBEEFCAFEBABE,
            vec![(Ipv4Addr::new(10, 0, 0, 1), 6881)],
        )
        .await;

        let tracker = UdpTracker::connect("127.0.0.1", addr.port()).await.unwrap();
        assert_eq!(tracker.connection_id, 0xDEADBEEFCAFEBABE);

        let response = tracker.announce(&announce_for([1u8; 20])).await.unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.leechers, 1);
        assert_eq!(response.seeders, 2);
        assert_eq!(response.peers, vec!["10.0.0.1:6881".parse().unwrap()]);
    }

    #[tokio::test]
    async fn empty_peer_list_is_a_valid_answer() {
        let addr = stub_tracker(7, vec![]).await;
        let tracker = UdpTracker::connect("127.0.0.1", addr.port()).await.unwrap();
        let response = tracker.announce(&announce_for([1u8; 20])).await.unwrap();
        assert!(response.peers.is_empty());
    }

    #[tokio::test]
    async fn mismatched_transaction_id_is_a_protocol_error() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            let (n, from) = socket.recv_from(&mut buf).await.unwrap();
            let mut cursor = Cursor::new(&buf[..n]);
            cursor.read_u64::<BigEndian>().unwrap();
            cursor.read_u32::<BigEndian>().unwrap();
            let tx = cursor.read_u32::<BigEndian>().unwrap();
            let mut reply = Vec::new();
            reply.write_u32::<BigEndian>(ACTION_CONNECT).unwrap();
            reply.write_u32::<BigEndian>(tx.wrapping_add(1)).unwrap();
            reply.write_u64::<BigEndian>(1).unwrap();
            socket.send_to(&reply, from).await.unwrap();
        });

        assert!(matches!(
            UdpTracker::connect("127.0.0.1", addr.port()).await,
            Err(TrackerError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn fetch_peers_skips_unsupported_schemes() {
        let trackers = vec!["http://tracker.example/announce".to_string()];
        assert!(matches!(
            fetch_peers(&trackers, &announce_for([1u8; 20])).await,
            Err(TrackerError::AllTrackersFailed)
        ));
    }
}

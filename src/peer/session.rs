//! Per-peer session state machines.
//!
//! A [`PeerSession`] drives one TCP connection for a torrent download:
//! handshake, bitfield/unchoke preamble, then a loop over inbound messages
//! that feeds the scheduler and storage. A [`MetadataSession`] is the
//! simpler machine used during magnet bootstrap, speaking only the
//! ut_metadata extension until it has the whole info-dict.
use crate::bitfield::Bitfield;
use crate::scheduler::{BlockRequest, Scheduler};
use crate::storage::{Storage, StorageError};
use crate::torrent::metainfo::{sha1, Metainfo};

use super::extension::{
    build_extension_handshake, parse_extension_handshake, MetadataMessage, EXTENSION_HANDSHAKE_ID,
    MAX_METADATA_SIZE, METADATA_PIECE_SIZE, UT_METADATA_ID,
};
use super::handshake::Handshake;
use super::message::Message;
use super::PeerError;
use super::PeerId;
use super::PeerResult;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Applied to connect and to every socket read and write.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection-scoped protocol state. Both directions start choked and
/// uninterested.
#[derive(Debug)]
pub struct PeerState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    /// The peer's advertised pieces. None until a bitfield or first have
    /// arrives; a have without a preceding bitfield starts from all-zero.
    pub bits: Option<Bitfield>,
    /// Requests sent to this peer and not yet answered.
    pub in_flight: HashSet<BlockRequest>,
}

impl PeerState {
    fn new() -> PeerState {
        PeerState {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bits: None,
            in_flight: HashSet::new(),
        }
    }
}

async fn send<S: AsyncWrite + Unpin>(stream: &mut S, msg: Message) -> PeerResult<()> {
    trace!(?msg, "sending");
    timeout(PEER_TIMEOUT, stream.write_all(&msg.serialize()))
        .await
        .map_err(|_| PeerError::Timeout)?
        .map_err(PeerError::from_io)
}

async fn recv<S: AsyncRead + Unpin>(stream: &mut S) -> PeerResult<Message> {
    timeout(PEER_TIMEOUT, Message::read(stream))
        .await
        .map_err(|_| PeerError::Timeout)?
}

/// One torrent-mode peer connection.
pub struct PeerSession {
    addr: SocketAddr,
    our_id: PeerId,
    meta: Arc<Metainfo>,
    storage: Arc<Mutex<Storage>>,
    scheduler: Arc<Mutex<Scheduler>>,
}

impl PeerSession {
    pub fn new(
        addr: SocketAddr,
        our_id: PeerId,
        meta: Arc<Metainfo>,
        storage: Arc<Mutex<Storage>>,
        scheduler: Arc<Mutex<Scheduler>>,
    ) -> PeerSession {
        PeerSession {
            addr,
            our_id,
            meta,
            storage,
            scheduler,
        }
    }

    /// Connects and drives the session to its end. `Ok(())` is the
    /// completion sentinel: every piece is stored and validated. Any error
    /// ends this session only.
    pub async fn run(self) -> PeerResult<()> {
        debug!(addr = %self.addr, "connecting to peer");
        let mut stream = timeout(PEER_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| PeerError::Timeout)?
            .map_err(PeerError::from_io)?;
        self.run_on(&mut stream).await
    }

    /// The session proper, once a transport exists. Split from [`run`] so
    /// tests can drive it over an in-memory stream.
    pub(crate) async fn run_on<S>(&self, stream: &mut S) -> PeerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ours = Handshake::new(self.meta.info_hash, self.our_id);
        timeout(PEER_TIMEOUT, stream.write_all(&ours.serialize()))
            .await
            .map_err(|_| PeerError::Timeout)?
            .map_err(PeerError::from_io)?;
        let theirs = timeout(PEER_TIMEOUT, Handshake::read(stream))
            .await
            .map_err(|_| PeerError::Timeout)??;
        theirs.validate(&self.meta.info_hash)?;
        if theirs.peer_id == self.our_id {
            return Err(PeerError::Protocol("connected to ourselves".to_string()));
        }
        debug!(addr = %self.addr, peer_id = %hex::encode(theirs.peer_id), "handshake complete");

        let result = self.drive(stream, &theirs.peer_id).await;
        // Whatever ended the session, release any block claims it held.
        self.scheduler.lock().unwrap().on_disconnect(&theirs.peer_id);
        result
    }

    async fn drive<S>(&self, stream: &mut S, remote_id: &PeerId) -> PeerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut state = PeerState::new();

        let own = self.own_bits();
        if own.any() {
            send(stream, Message::Bitfield(own.as_bytes().to_vec())).await?;
        }
        send(stream, Message::Unchoke).await?;
        state.am_choking = false;

        let mut seen_unknown: HashSet<u8> = HashSet::new();
        loop {
            let msg = recv(stream).await?;
            let complete = self
                .handle(stream, &mut state, remote_id, msg, &mut seen_unknown)
                .await?;
            if complete {
                info!(addr = %self.addr, "all pieces complete");
                return Ok(());
            }
        }
    }

    fn own_bits(&self) -> Bitfield {
        self.storage.lock().unwrap().bits().clone()
    }

    /// Handles one inbound message. Returns true once every piece is
    /// stored, which ends the session as a success.
    async fn handle<S>(
        &self,
        stream: &mut S,
        state: &mut PeerState,
        remote_id: &PeerId,
        msg: Message,
        seen_unknown: &mut HashSet<u8>,
    ) -> PeerResult<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match msg {
            Message::KeepAlive => trace!("keep-alive"),
            Message::Choke => {
                debug!(addr = %self.addr, "choked by peer");
                state.peer_choking = true;
                self.scheduler
                    .lock()
                    .unwrap()
                    .on_choke(remote_id, &state.in_flight);
                state.in_flight.clear();
            }
            Message::Unchoke => {
                debug!(addr = %self.addr, "unchoked by peer");
                state.peer_choking = false;
                self.refill(stream, state, remote_id).await?;
            }
            Message::Interested => state.peer_interested = true,
            Message::NotInterested => state.peer_interested = false,
            Message::Bitfield(bytes) => {
                if state.bits.is_some() {
                    return Err(PeerError::Protocol(
                        "bitfield after the peer's bits are already known".to_string(),
                    ));
                }
                let bits = Bitfield::from_bytes(&bytes, self.meta.num_pieces())
                    .map_err(|e| PeerError::Protocol(e.to_string()))?;
                debug!(addr = %self.addr, have = bits.count(), "peer sent bitfield");
                state.bits = Some(bits);
                self.update_interest(stream, state).await?;
                self.refill(stream, state, remote_id).await?;
            }
            Message::Have(index) => {
                if index as usize >= self.meta.num_pieces() {
                    return Err(PeerError::Protocol(format!(
                        "have for piece {index} past the manifest"
                    )));
                }
                state
                    .bits
                    .get_or_insert_with(|| Bitfield::new(self.meta.num_pieces()))
                    .set(index as usize);
                self.update_interest(stream, state).await?;
                self.refill(stream, state, remote_id).await?;
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                trace!(index, begin, length, "peer requested a block");
                let data = self
                    .storage
                    .lock()
                    .unwrap()
                    .read(index as usize, begin as u64, length as u64)
                    .map_err(|e| match e {
                        StorageError::OutOfRange { .. } => {
                            PeerError::Protocol(format!("request outside piece {index}"))
                        }
                        other => PeerError::Storage(other),
                    })?;
                send(stream, Message::Piece { index, begin, data }).await?;
            }
            Message::Piece { index, begin, data } => {
                return self
                    .on_piece(stream, state, remote_id, index, begin, data)
                    .await;
            }
            Message::Cancel { .. } | Message::Port(_) => trace!(?msg, "ignored"),
            Message::Extended { id, .. } => trace!(id, "ignoring extended message"),
            Message::Unknown(id) => {
                if seen_unknown.insert(id) {
                    warn!(addr = %self.addr, id, "peer sent an unknown message type");
                }
            }
        }
        Ok(false)
    }

    async fn on_piece<S>(
        &self,
        stream: &mut S,
        state: &mut PeerState,
        remote_id: &PeerId,
        index: u32,
        begin: u32,
        data: Vec<u8>,
    ) -> PeerResult<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let req = BlockRequest {
            index,
            begin,
            length: data.len() as u32,
        };
        trace!(?req, "block received");
        if !state.in_flight.remove(&req) {
            warn!(addr = %self.addr, ?req, "dropping unsolicited block");
            return Ok(false);
        }

        self.storage
            .lock()
            .unwrap()
            .write(index as usize, begin as u64, &data)?;

        let piece_done = self
            .scheduler
            .lock()
            .unwrap()
            .on_block_received(remote_id, &req);
        if piece_done {
            let validated = self.storage.lock().unwrap().validate(&[index as usize])?;
            if validated == 0 {
                warn!(piece = index, "piece failed validation, requeueing its blocks");
                self.scheduler
                    .lock()
                    .unwrap()
                    .requeue_piece(&self.meta, index);
            }
        }

        if self.storage.lock().unwrap().is_complete() {
            return Ok(true);
        }
        self.update_interest(stream, state).await?;
        self.refill(stream, state, remote_id).await?;
        Ok(false)
    }

    /// Announces or withdraws interest when the needed set flips between
    /// empty and non-empty.
    async fn update_interest<S>(&self, stream: &mut S, state: &mut PeerState) -> PeerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(bits) = &state.bits else {
            return Ok(());
        };
        let needed = bits.and_not(&self.own_bits());
        if needed.any() && !state.am_interested {
            debug!(addr = %self.addr, needed = needed.count(), "interested in peer");
            state.am_interested = true;
            send(stream, Message::Interested).await?;
        } else if !needed.any() && state.am_interested {
            debug!(addr = %self.addr, "no longer interested in peer");
            state.am_interested = false;
            send(stream, Message::NotInterested).await?;
        }
        Ok(())
    }

    /// Tops the pipeline up to depth. Claims happen under the scheduler
    /// lock; the wire writes happen after it is released.
    async fn refill<S>(
        &self,
        stream: &mut S,
        state: &mut PeerState,
        remote_id: &PeerId,
    ) -> PeerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if state.peer_choking {
            return Ok(());
        }
        let Some(bits) = &state.bits else {
            return Ok(());
        };
        let claimed = {
            let own = self.own_bits();
            self.scheduler.lock().unwrap().next_requests(
                remote_id,
                bits,
                &own,
                state.in_flight.len(),
            )
        };
        for req in &claimed {
            state.in_flight.insert(*req);
        }
        for req in claimed {
            debug!(?req, "requesting block");
            send(
                stream,
                Message::Request {
                    index: req.index,
                    begin: req.begin,
                    length: req.length,
                },
            )
            .await?;
        }
        Ok(())
    }
}

/// One metadata-mode peer connection: fetches the raw info-dict via
/// ut_metadata during magnet bootstrap. `Ok(bytes)` carries the verified
/// info-dict encoding.
pub struct MetadataSession {
    addr: SocketAddr,
    our_id: PeerId,
    info_hash: [u8; 20],
}

impl MetadataSession {
    pub fn new(addr: SocketAddr, our_id: PeerId, info_hash: [u8; 20]) -> MetadataSession {
        MetadataSession {
            addr,
            our_id,
            info_hash,
        }
    }

    pub async fn run(self) -> PeerResult<Vec<u8>> {
        debug!(addr = %self.addr, "connecting for metadata");
        let mut stream = timeout(PEER_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| PeerError::Timeout)?
            .map_err(PeerError::from_io)?;
        self.run_on(&mut stream).await
    }

    pub(crate) async fn run_on<S>(&self, stream: &mut S) -> PeerResult<Vec<u8>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ours = Handshake::with_extensions(self.info_hash, self.our_id);
        timeout(PEER_TIMEOUT, stream.write_all(&ours.serialize()))
            .await
            .map_err(|_| PeerError::Timeout)?
            .map_err(PeerError::from_io)?;
        let theirs = timeout(PEER_TIMEOUT, Handshake::read(stream))
            .await
            .map_err(|_| PeerError::Timeout)??;
        theirs.validate(&self.info_hash)?;
        if !theirs.supports_extensions() {
            return Err(PeerError::Protocol(
                "peer lacks extension-protocol support".to_string(),
            ));
        }

        send(
            stream,
            Message::Extended {
                id: EXTENSION_HANDSHAKE_ID,
                payload: build_extension_handshake()?,
            },
        )
        .await?;

        let mut peer_ut_id: Option<u8> = None;
        let mut unchoked = false;
        let mut requested = false;
        let mut metadata: Vec<u8> = Vec::new();
        // The total_size declared by the peer's first data message; bounds
        // the assembly once known.
        let mut declared_total: Option<usize> = None;

        loop {
            match recv(stream).await? {
                Message::Unchoke => {
                    unchoked = true;
                    self.maybe_start(stream, peer_ut_id, unchoked, &mut requested)
                        .await?;
                }
                Message::Choke => unchoked = false,
                Message::Extended {
                    id: EXTENSION_HANDSHAKE_ID,
                    payload,
                } => {
                    peer_ut_id = parse_extension_handshake(&payload)?;
                    if peer_ut_id.is_none() {
                        return Err(PeerError::Protocol(
                            "peer does not offer ut_metadata".to_string(),
                        ));
                    }
                    self.maybe_start(stream, peer_ut_id, unchoked, &mut requested)
                        .await?;
                }
                Message::Extended {
                    id: UT_METADATA_ID,
                    payload,
                } => match MetadataMessage::decode(&payload)? {
                    MetadataMessage::Data {
                        piece,
                        total_size,
                        payload,
                    } => {
                        if payload.len() > METADATA_PIECE_SIZE {
                            return Err(PeerError::MalformedMessage(format!(
                                "metadata piece of {} bytes",
                                payload.len()
                            )));
                        }
                        if let Some(total) = total_size {
                            let total = total as usize;
                            if total > MAX_METADATA_SIZE {
                                return Err(PeerError::Protocol(format!(
                                    "metadata of {total} bytes refused"
                                )));
                            }
                            match declared_total {
                                None => declared_total = Some(total),
                                Some(known) if known != total => {
                                    return Err(PeerError::Protocol(format!(
                                        "total_size changed from {known} to {total} mid-transfer"
                                    )));
                                }
                                Some(_) => {}
                            }
                        }
                        debug!(piece, bytes = payload.len(), "metadata piece received");
                        metadata.extend_from_slice(&payload);
                        let limit = declared_total.unwrap_or(MAX_METADATA_SIZE);
                        if metadata.len() > limit {
                            return Err(PeerError::Protocol(format!(
                                "metadata grew past the expected {limit} bytes"
                            )));
                        }
                        if sha1(&metadata) == self.info_hash {
                            info!(addr = %self.addr, bytes = metadata.len(), "metadata complete");
                            return Ok(metadata);
                        }
                        if declared_total == Some(metadata.len()) {
                            return Err(PeerError::Protocol(
                                "assembled metadata does not hash to the info-hash".to_string(),
                            ));
                        }
                        if let Some(ut_id) = peer_ut_id {
                            self.request_piece(stream, ut_id, piece + 1).await?;
                        }
                    }
                    MetadataMessage::Reject { piece } => {
                        return Err(PeerError::Protocol(format!(
                            "peer rejected metadata piece {piece}"
                        )));
                    }
                    MetadataMessage::Request { .. } => {
                        trace!("ignoring metadata request from peer");
                    }
                },
                other => trace!(?other, "ignored during metadata exchange"),
            }
        }
    }

    async fn maybe_start<S>(
        &self,
        stream: &mut S,
        peer_ut_id: Option<u8>,
        unchoked: bool,
        requested: &mut bool,
    ) -> PeerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if *requested || !unchoked {
            return Ok(());
        }
        let Some(ut_id) = peer_ut_id else {
            return Ok(());
        };
        *requested = true;
        self.request_piece(stream, ut_id, 0).await
    }

    async fn request_piece<S>(&self, stream: &mut S, ut_id: u8, piece: u32) -> PeerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!(piece, "requesting metadata piece");
        send(
            stream,
            Message::Extended {
                id: ut_id,
                payload: MetadataMessage::Request { piece }.encode()?,
            },
        )
        .await
    }
}

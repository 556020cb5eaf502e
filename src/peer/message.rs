//! Length-prefixed peer-wire messages.
//!
//! Every message after the handshake is a big-endian `u32` length followed
//! by that many payload bytes; a zero length is a keep-alive. The first
//! payload byte is the message type. Unknown types become
//! [`Message::Unknown`] so a session can skip them, while a known type with
//! the wrong payload size is an error that ends the session.
use super::PeerError;
use super::PeerResult;
use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on a single frame. The largest legitimate messages are a
/// piece (block size + 9) and a bitfield; anything past this is a peer
/// trying to make us allocate.
const MAX_MESSAGE_LEN: usize = 1 << 21;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        data: Vec<u8>,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
    Port(u16),
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
    Unknown(u8),
}

impl Message {
    /// Serializes the message into a full wire frame, length prefix
    /// included.
    pub fn serialize(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Message::KeepAlive => {}
            Message::Choke => payload.put_u8(0),
            Message::Unchoke => payload.put_u8(1),
            Message::Interested => payload.put_u8(2),
            Message::NotInterested => payload.put_u8(3),
            Message::Have(index) => {
                payload.put_u8(4);
                payload.put_u32(*index);
            }
            Message::Bitfield(bits) => {
                payload.put_u8(5);
                payload.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                payload.put_u8(6);
                payload.put_u32(*index);
                payload.put_u32(*begin);
                payload.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                payload.put_u8(7);
                payload.put_u32(*index);
                payload.put_u32(*begin);
                payload.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                payload.put_u8(8);
                payload.put_u32(*index);
                payload.put_u32(*begin);
                payload.put_u32(*length);
            }
            Message::Port(port) => {
                payload.put_u8(9);
                payload.put_u16(*port);
            }
            Message::Extended { id, payload: ext } => {
                payload.put_u8(20);
                payload.put_u8(*id);
                payload.put_slice(ext);
            }
            Message::Unknown(id) => payload.put_u8(*id),
        }

        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(&payload);
        frame
    }

    /// Parses a complete frame (length prefix included). The inverse of
    /// [`Message::serialize`].
    pub fn parse(mut frame: &[u8]) -> PeerResult<Message> {
        if frame.len() < 4 {
            return Err(PeerError::MalformedMessage(
                "frame shorter than the length prefix".to_string(),
            ));
        }
        let length = frame.get_u32() as usize;
        if frame.len() != length {
            return Err(PeerError::MalformedMessage(format!(
                "length prefix says {} payload bytes, frame carries {}",
                length,
                frame.len()
            )));
        }
        Self::from_payload(frame)
    }

    /// Reads one frame from the stream.
    pub async fn read<S: AsyncRead + Unpin>(stream: &mut S) -> PeerResult<Message> {
        let mut length_buf = [0u8; 4];
        stream
            .read_exact(&mut length_buf)
            .await
            .map_err(PeerError::from_io)?;
        let length = u32::from_be_bytes(length_buf) as usize;
        if length > MAX_MESSAGE_LEN {
            return Err(PeerError::MalformedMessage(format!(
                "frame of {length} bytes exceeds the message cap"
            )));
        }
        let mut payload = vec![0u8; length];
        stream
            .read_exact(&mut payload)
            .await
            .map_err(PeerError::from_io)?;
        Self::from_payload(&payload)
    }

    fn from_payload(mut body: &[u8]) -> PeerResult<Message> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let id = body.get_u8();

        let expect_len = |got: usize, wanted: usize| -> PeerResult<()> {
            if got != wanted {
                return Err(PeerError::MalformedMessage(format!(
                    "message {id} has {got} payload bytes, expected {wanted}"
                )));
            }
            Ok(())
        };

        let msg = match id {
            0 => {
                expect_len(body.len(), 0)?;
                Message::Choke
            }
            1 => {
                expect_len(body.len(), 0)?;
                Message::Unchoke
            }
            2 => {
                expect_len(body.len(), 0)?;
                Message::Interested
            }
            3 => {
                expect_len(body.len(), 0)?;
                Message::NotInterested
            }
            4 => {
                expect_len(body.len(), 4)?;
                Message::Have(body.get_u32())
            }
            5 => Message::Bitfield(body.to_vec()),
            6 | 8 => {
                expect_len(body.len(), 12)?;
                let index = body.get_u32();
                let begin = body.get_u32();
                let length = body.get_u32();
                if id == 6 {
                    Message::Request {
                        index,
                        begin,
                        length,
                    }
                } else {
                    Message::Cancel {
                        index,
                        begin,
                        length,
                    }
                }
            }
            7 => {
                if body.len() < 8 {
                    return Err(PeerError::MalformedMessage(
                        "piece message too short for its header".to_string(),
                    ));
                }
                Message::Piece {
                    index: body.get_u32(),
                    begin: body.get_u32(),
                    data: body.to_vec(),
                }
            }
            9 => {
                expect_len(body.len(), 2)?;
                Message::Port(body.get_u16())
            }
            20 => {
                if body.is_empty() {
                    return Err(PeerError::MalformedMessage(
                        "extended message without a sub-id".to_string(),
                    ));
                }
                Message::Extended {
                    id: body.get_u8(),
                    payload: body.to_vec(),
                }
            }
            other => Message::Unknown(other),
        };
        Ok(msg)
    }
}

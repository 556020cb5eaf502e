//! BEP-10 extension negotiation and the ut_metadata sub-protocol.
//!
//! Extended messages ride inside wire type 20. Sub-id 0 is the extension
//! handshake: a bencode dictionary whose `m` entry maps extension names to
//! the sub-ids the sending peer listens on. The only extension spoken here
//! is `ut_metadata`, which transfers the raw info-dict in 16 KiB pieces so
//! a magnet-only client can learn the piece manifest.
use crate::bencode::{decoder, encoder, BencodeValue};

use super::PeerError;
use super::PeerResult;

/// Extended sub-id of the extension handshake itself.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// The sub-id we advertise for ut_metadata; peers address their metadata
/// messages to us with it.
pub const UT_METADATA_ID: u8 = 1;

/// Metadata transfers in 16 KiB pieces, the last possibly short.
pub const METADATA_PIECE_SIZE: usize = 1 << 14;

/// Ceiling on an assembled info-dict when the peer never declares
/// `total_size`. Even very large torrents stay well under this.
pub const MAX_METADATA_SIZE: usize = 1 << 22;

const MSG_TYPE_REQUEST: i64 = 0;
const MSG_TYPE_DATA: i64 = 1;
const MSG_TYPE_REJECT: i64 = 2;

/// The extension handshake payload: `{"m": {"ut_metadata": <id>}}`.
pub fn build_extension_handshake() -> PeerResult<Vec<u8>> {
    let m = BencodeValue::Dict(vec![(
        b"ut_metadata".to_vec(),
        BencodeValue::Integer(UT_METADATA_ID as i64),
    )]);
    let handshake = BencodeValue::Dict(vec![(b"m".to_vec(), m)]);
    Ok(encoder::encode_to_vec(&handshake)?)
}

/// Extracts the peer's ut_metadata sub-id from its extension handshake.
/// Returns None when the peer does not offer the extension.
pub fn parse_extension_handshake(payload: &[u8]) -> PeerResult<Option<u8>> {
    // Trailing bytes are tolerated: some clients append fields after the
    // dictionary.
    let (handshake, _) = decoder::decode_prefix(payload)?;
    let id = handshake
        .find(b"m")
        .and_then(|m| m.find(b"ut_metadata"))
        .and_then(|v| v.as_int());
    match id {
        Some(id) if (0..=u8::MAX as i64).contains(&id) => Ok(Some(id as u8)),
        Some(id) => Err(PeerError::MalformedMessage(format!(
            "ut_metadata id {id} does not fit a sub-id byte"
        ))),
        None => Ok(None),
    }
}

/// One ut_metadata message. `msg_type` 0 requests a metadata piece, 1
/// answers with its bytes, 2 refuses. Data messages carry the size of the
/// whole info-dict in `total_size`, which requesters use to bound the
/// assembly; some clients omit it, so it stays optional here.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum MetadataMessage {
    Request {
        piece: u32,
    },
    Data {
        piece: u32,
        total_size: Option<u64>,
        payload: Vec<u8>,
    },
    Reject {
        piece: u32,
    },
}

impl MetadataMessage {
    pub fn encode(&self) -> PeerResult<Vec<u8>> {
        let (msg_type, piece, total_size, payload) = match self {
            MetadataMessage::Request { piece } => (MSG_TYPE_REQUEST, *piece, None, None),
            MetadataMessage::Data {
                piece,
                total_size,
                payload,
            } => (MSG_TYPE_DATA, *piece, *total_size, Some(payload)),
            MetadataMessage::Reject { piece } => (MSG_TYPE_REJECT, *piece, None, None),
        };
        let mut pairs = vec![
            (b"msg_type".to_vec(), BencodeValue::Integer(msg_type)),
            (b"piece".to_vec(), BencodeValue::Integer(piece as i64)),
        ];
        if let Some(total) = total_size {
            pairs.push((b"total_size".to_vec(), BencodeValue::Integer(total as i64)));
        }
        let mut bytes = encoder::encode_to_vec(&BencodeValue::Dict(pairs))?;
        if let Some(payload) = payload {
            bytes.extend_from_slice(payload);
        }
        Ok(bytes)
    }

    /// Decodes a ut_metadata payload. For data messages the raw piece bytes
    /// are whatever follows the bencode dictionary.
    pub fn decode(bytes: &[u8]) -> PeerResult<MetadataMessage> {
        let (dict, rest) = decoder::decode_prefix(bytes)?;
        let msg_type = dict
            .find(b"msg_type")
            .and_then(|v| v.as_int())
            .ok_or_else(|| {
                PeerError::MalformedMessage("ut_metadata message without msg_type".to_string())
            })?;
        let piece = dict
            .find(b"piece")
            .and_then(|v| v.as_int())
            .filter(|&p| p >= 0)
            .ok_or_else(|| {
                PeerError::MalformedMessage("ut_metadata message without piece".to_string())
            })? as u32;
        let total_size = dict
            .find(b"total_size")
            .and_then(|v| v.as_int())
            .filter(|&t| t >= 0)
            .map(|t| t as u64);

        match msg_type {
            MSG_TYPE_REQUEST => Ok(MetadataMessage::Request { piece }),
            MSG_TYPE_DATA => Ok(MetadataMessage::Data {
                piece,
                total_size,
                payload: rest.to_vec(),
            }),
            MSG_TYPE_REJECT => Ok(MetadataMessage::Reject { piece }),
            other => Err(PeerError::MalformedMessage(format!(
                "unknown ut_metadata msg_type {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_handshake_round_trips() {
        let payload = build_extension_handshake().unwrap();
        assert_eq!(payload, b"d1:md11:ut_metadatai1eee");
        assert_eq!(
            parse_extension_handshake(&payload).unwrap(),
            Some(UT_METADATA_ID)
        );
    }

    #[test]
    fn handshake_without_ut_metadata_is_none() {
        assert_eq!(parse_extension_handshake(b"d1:mdee").unwrap(), None);
        assert_eq!(parse_extension_handshake(b"de").unwrap(), None);
    }

    #[test]
    fn request_and_reject_round_trip() {
        for msg in [
            MetadataMessage::Request { piece: 0 },
            MetadataMessage::Reject { piece: 3 },
        ] {
            assert_eq!(
                MetadataMessage::decode(&msg.encode().unwrap()).unwrap(),
                msg
            );
        }
        assert_eq!(
            MetadataMessage::Request { piece: 2 }.encode().unwrap(),
            b"d8:msg_typei0e5:piecei2ee"
        );
    }

    #[test]
    fn data_carries_raw_bytes_after_the_dict() {
        let msg = MetadataMessage::Data {
            piece: 1,
            total_size: Some(15),
            payload: b"info dict bytes".to_vec(),
        };
        let encoded = msg.encode().unwrap();
        assert!(encoded.starts_with(b"d8:msg_typei1e5:piecei1e10:total_sizei15ee"));
        assert_eq!(MetadataMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn data_without_total_size_still_decodes() {
        let bytes = b"d8:msg_typei1e5:piecei0eeraw";
        assert_eq!(
            MetadataMessage::decode(bytes).unwrap(),
            MetadataMessage::Data {
                piece: 0,
                total_size: None,
                payload: b"raw".to_vec(),
            }
        );
    }

    #[test]
    fn rejects_unknown_msg_type() {
        let bytes = b"d8:msg_typei9e5:piecei0ee";
        assert!(matches!(
            MetadataMessage::decode(bytes),
            Err(PeerError::MalformedMessage(_))
        ));
    }
}

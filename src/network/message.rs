//! P2P message set and wire framing.
//!
//! Frames are `[4-byte big-endian length][1-byte type tag][payload]`,
//! where the length covers the tag and payload and the payload is the
//! canonical encoding of the per-message struct. Oversized or unknown
//! frames are protocol violations.

use crate::core::block::Block;
use crate::core::params::MAX_MESSAGE_BYTES;
use crate::core::transaction::Transaction;
use crate::core::validator::ValidationError;
use crate::types::encoding::canonical_bytes;
use crate::types::hash::Hash;
use serde::{Deserialize, Serialize};

/// First message on every connection, sent by both sides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub version: u8,
    pub height: u64,
    pub genesis_hash: Hash,
}

/// A dialable peer address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeersResponse {
    pub peers: Vec<PeerAddr>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxAnnounce {
    pub tx_hash: Hash,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRequest {
    pub tx_hash: Hash,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResponse {
    pub transaction: Option<Transaction>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAnnounce {
    pub block_hash: Hash,
    pub height: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRequest {
    pub block_hash: Option<Hash>,
    pub height: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockResponse {
    pub block: Option<Block>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub from_height: u64,
    pub to_height: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub blocks: Vec<Block>,
}

/// A P2P protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Handshake(Handshake),
    PeersRequest,
    PeersResponse(PeersResponse),
    TxAnnounce(TxAnnounce),
    TxRequest(TxRequest),
    TxResponse(TxResponse),
    BlockAnnounce(BlockAnnounce),
    BlockRequest(BlockRequest),
    BlockResponse(BlockResponse),
    SyncRequest(SyncRequest),
    SyncResponse(SyncResponse),
}

impl Message {
    /// Wire tag identifying the payload type.
    pub fn tag(&self) -> u8 {
        match self {
            Message::Handshake(_) => 0,
            Message::PeersRequest => 1,
            Message::PeersResponse(_) => 2,
            Message::TxAnnounce(_) => 3,
            Message::TxRequest(_) => 4,
            Message::TxResponse(_) => 5,
            Message::BlockAnnounce(_) => 6,
            Message::BlockRequest(_) => 7,
            Message::BlockResponse(_) => 8,
            Message::SyncRequest(_) => 9,
            Message::SyncResponse(_) => 10,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Message::Handshake(m) => canonical_bytes(m),
            Message::PeersRequest => b"{}".to_vec(),
            Message::PeersResponse(m) => canonical_bytes(m),
            Message::TxAnnounce(m) => canonical_bytes(m),
            Message::TxRequest(m) => canonical_bytes(m),
            Message::TxResponse(m) => canonical_bytes(m),
            Message::BlockAnnounce(m) => canonical_bytes(m),
            Message::BlockRequest(m) => canonical_bytes(m),
            Message::BlockResponse(m) => canonical_bytes(m),
            Message::SyncRequest(m) => canonical_bytes(m),
            Message::SyncResponse(m) => canonical_bytes(m),
        }
    }

    /// Serializes to a complete length-prefixed frame.
    pub fn encode_frame(&self) -> Result<Vec<u8>, ValidationError> {
        let payload = self.payload();
        let body_len = payload.len() + 1;
        if body_len > MAX_MESSAGE_BYTES {
            return Err(ValidationError::PeerProtocol(format!(
                "message too large: {body_len} bytes"
            )));
        }
        let mut frame = Vec::with_capacity(4 + body_len);
        frame.extend_from_slice(&(body_len as u32).to_be_bytes());
        frame.push(self.tag());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Deserializes a frame body (the bytes after the length prefix).
    pub fn decode_body(body: &[u8]) -> Result<Message, ValidationError> {
        let (&tag, payload) = body
            .split_first()
            .ok_or_else(|| ValidationError::PeerProtocol("empty frame".into()))?;

        fn parse<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, ValidationError> {
            serde_json::from_slice(payload)
                .map_err(|e| ValidationError::PeerProtocol(format!("bad payload: {e}")))
        }

        Ok(match tag {
            0 => Message::Handshake(parse(payload)?),
            1 => Message::PeersRequest,
            2 => Message::PeersResponse(parse(payload)?),
            3 => Message::TxAnnounce(parse(payload)?),
            4 => Message::TxRequest(parse(payload)?),
            5 => Message::TxResponse(parse(payload)?),
            6 => Message::BlockAnnounce(parse(payload)?),
            7 => Message::BlockRequest(parse(payload)?),
            8 => Message::BlockResponse(parse(payload)?),
            9 => Message::SyncRequest(parse(payload)?),
            10 => Message::SyncResponse(parse(payload)?),
            other => {
                return Err(ValidationError::PeerProtocol(format!(
                    "unknown message tag {other}"
                )));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::ChainParams;
    use crate::utils::test_utils::{key, GENESIS_KEY_SEED};

    fn roundtrip(msg: Message) -> Message {
        let frame = msg.encode_frame().expect("encodes");
        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);
        Message::decode_body(&frame[4..]).expect("decodes")
    }

    #[test]
    fn handshake_roundtrip() {
        let msg = Message::Handshake(Handshake {
            version: 1,
            height: 42,
            genesis_hash: Hash::sha256(b"genesis"),
        });
        assert_eq!(roundtrip(msg.clone()), msg);
        assert_eq!(msg.tag(), 0);
    }

    #[test]
    fn peers_messages_roundtrip() {
        assert_eq!(roundtrip(Message::PeersRequest), Message::PeersRequest);

        let msg = Message::PeersResponse(PeersResponse {
            peers: vec![PeerAddr {
                host: "127.0.0.1".into(),
                port: 9333,
            }],
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn gossip_messages_roundtrip() {
        let hash = Hash::sha256(b"tx");
        for msg in [
            Message::TxAnnounce(TxAnnounce { tx_hash: hash }),
            Message::TxRequest(TxRequest { tx_hash: hash }),
            Message::TxResponse(TxResponse { transaction: None }),
            Message::BlockAnnounce(BlockAnnounce {
                block_hash: hash,
                height: 7,
            }),
            Message::BlockRequest(BlockRequest {
                block_hash: Some(hash),
                height: None,
            }),
            Message::BlockResponse(BlockResponse { block: None }),
            Message::SyncRequest(SyncRequest {
                from_height: 1,
                to_height: 50,
            }),
            Message::SyncResponse(SyncResponse { blocks: vec![] }),
        ] {
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn block_response_carries_full_block() {
        let genesis = ChainParams::dev(key(GENESIS_KEY_SEED).public_key()).build_genesis();
        let msg = Message::BlockResponse(BlockResponse {
            block: Some(genesis.clone()),
        });
        let Message::BlockResponse(back) = roundtrip(msg) else {
            panic!("wrong message type");
        };
        assert_eq!(back.block.unwrap().block_hash(), genesis.block_hash());
    }

    #[test]
    fn tags_are_stable() {
        let hash = Hash::zero();
        assert_eq!(Message::PeersRequest.tag(), 1);
        assert_eq!(Message::TxAnnounce(TxAnnounce { tx_hash: hash }).tag(), 3);
        assert_eq!(
            Message::SyncRequest(SyncRequest {
                from_height: 0,
                to_height: 0
            })
            .tag(),
            9
        );
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(matches!(
            Message::decode_body(&[99, b'{', b'}']),
            Err(ValidationError::PeerProtocol(_))
        ));
    }

    #[test]
    fn empty_frame_rejected() {
        assert!(Message::decode_body(&[]).is_err());
    }

    #[test]
    fn malformed_payload_rejected() {
        assert!(matches!(
            Message::decode_body(&[0, b'n', b'o']),
            Err(ValidationError::PeerProtocol(_))
        ));
    }
}

use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

// largest frame we accept; a bitfield for ~8M pieces or a 16 KiB block fit easily
pub const MAX_FRAME_LEN: u32 = 1 << 20;

pub mod btid {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTEREST: u8 = 2;
    pub const UNINTEREST: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have,
    Bitfield,
    Request,
    Piece,
    Cancel,
    /// Anything outside the core protocol (extensions, fast peers, ...).
    Unknown(u8),
}

impl From<u8> for MessageId {
    fn from(id: u8) -> Self {
        match id {
            btid::CHOKE => MessageId::Choke,
            btid::UNCHOKE => MessageId::Unchoke,
            btid::INTEREST => MessageId::Interested,
            btid::UNINTEREST => MessageId::NotInterested,
            btid::HAVE => MessageId::Have,
            btid::BITFIELD => MessageId::Bitfield,
            btid::REQUEST => MessageId::Request,
            btid::PIECE => MessageId::Piece,
            btid::CANCEL => MessageId::Cancel,
            other => MessageId::Unknown(other),
        }
    }
}

impl From<MessageId> for u8 {
    fn from(id: MessageId) -> Self {
        match id {
            MessageId::Choke => btid::CHOKE,
            MessageId::Unchoke => btid::UNCHOKE,
            MessageId::Interested => btid::INTEREST,
            MessageId::NotInterested => btid::UNINTEREST,
            MessageId::Have => btid::HAVE,
            MessageId::Bitfield => btid::BITFIELD,
            MessageId::Request => btid::REQUEST,
            MessageId::Piece => btid::PIECE,
            MessageId::Cancel => btid::CANCEL,
            MessageId::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Serialize)]
struct WireHandshake {
    len: u8,
    protocol: [u8; 19],
    reserved: [u8; 8],
    info_hash: [u8; 20],
    peer_id: [u8; 20],
}

/// A handshake as received from a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub pstr: Vec<u8>,
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

/// Serializes our side of the handshake, always 68 bytes.
pub fn encode_handshake(info_hash: &[u8; 20], peer_id: &[u8; 20]) -> Result<Vec<u8>> {
    let req = WireHandshake {
        len: PROTOCOL.len() as u8,
        protocol: *PROTOCOL,
        reserved: [0u8; 8],
        info_hash: *info_hash,
        peer_id: *peer_id,
    };
    bincode::serialize(&req).map_err(|e| Error::Protocol(format!("handshake encoding: {}", e)))
}

/// Reads a handshake of any protocol string length.
pub async fn decode_handshake<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Handshake> {
    let pstrlen = reader.read_u8().await? as usize;
    if pstrlen == 0 {
        return Err(Error::Protocol("pstrlen cannot be 0".into()));
    }

    let mut buf = vec![0u8; pstrlen + 48];
    reader.read_exact(&mut buf).await?;

    let mut reserved = [0u8; 8];
    let mut info_hash = [0u8; 20];
    let mut peer_id = [0u8; 20];
    reserved.copy_from_slice(&buf[pstrlen..pstrlen + 8]);
    info_hash.copy_from_slice(&buf[pstrlen + 8..pstrlen + 28]);
    peer_id.copy_from_slice(&buf[pstrlen + 28..]);

    Ok(Handshake {
        pstr: buf[..pstrlen].to_vec(),
        reserved,
        info_hash,
        peer_id,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

fn u32_triple(a: u32, b: u32, c: u32) -> Vec<u8> {
    let mut payload = vec![0u8; 12];
    BigEndian::write_u32(&mut payload[0..4], a);
    BigEndian::write_u32(&mut payload[4..8], b);
    BigEndian::write_u32(&mut payload[8..12], c);
    payload
}

impl Message {
    pub fn new(id: MessageId) -> Message {
        Message {
            id,
            payload: vec![],
        }
    }

    pub fn with_payload(id: MessageId, payload: Vec<u8>) -> Message {
        Message { id, payload }
    }

    pub fn request(index: u32, begin: u32, length: u32) -> Message {
        Message::with_payload(MessageId::Request, u32_triple(index, begin, length))
    }

    pub fn cancel(index: u32, begin: u32, length: u32) -> Message {
        Message::with_payload(MessageId::Cancel, u32_triple(index, begin, length))
    }

    pub fn have(index: u32) -> Message {
        Message::with_payload(MessageId::Have, index.to_be_bytes().to_vec())
    }

    pub fn piece(index: u32, begin: u32, block: &[u8]) -> Message {
        let mut payload = Vec::with_capacity(8 + block.len());
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(block);
        Message::with_payload(MessageId::Piece, payload)
    }

    /// `<len><id><payload>` with a big-endian length of `payload + 1`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 5 + self.payload.len()];
        BigEndian::write_u32(&mut buf[..4], (self.payload.len() + 1) as u32);
        buf[4] = self.id.into();
        buf[5..].copy_from_slice(&self.payload);
        buf
    }

    /// Reads one frame. `None` is a keep-alive.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
        let len = reader.read_u32().await?;

        // keep-alive message
        if len == 0 {
            return Ok(None);
        }
        if len > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!("frame of {} bytes is too long", len)));
        }

        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf).await?;
        let payload = buf.split_off(1);

        Ok(Some(Message {
            id: buf[0].into(),
            payload,
        }))
    }

    pub fn decode_have(&self) -> Result<u32> {
        if self.id != MessageId::Have {
            return Err(Error::Protocol(format!("expected have, got {:?}", self.id)));
        }
        if self.payload.len() != 4 {
            return Err(Error::Protocol(format!(
                "have payload of {} bytes",
                self.payload.len()
            )));
        }
        Ok(BigEndian::read_u32(&self.payload))
    }

    /// Splits a `piece` payload into `(index, begin, block)`.
    pub fn decode_piece(&self) -> Result<(u32, u32, &[u8])> {
        if self.id != MessageId::Piece {
            return Err(Error::Protocol(format!("expected piece, got {:?}", self.id)));
        }
        if self.payload.len() < 8 {
            return Err(Error::Protocol(format!(
                "piece payload of {} bytes",
                self.payload.len()
            )));
        }
        let index = BigEndian::read_u32(&self.payload[0..4]);
        let begin = BigEndian::read_u32(&self.payload[4..8]);
        Ok((index, begin, &self.payload[8..]))
    }

    /// Splits a `request` or `cancel` payload into `(index, begin, length)`.
    pub fn decode_request(&self) -> Result<(u32, u32, u32)> {
        if !matches!(self.id, MessageId::Request | MessageId::Cancel) || self.payload.len() != 12 {
            return Err(Error::Protocol(format!(
                "malformed {:?} of {} bytes",
                self.id,
                self.payload.len()
            )));
        }
        Ok((
            BigEndian::read_u32(&self.payload[0..4]),
            BigEndian::read_u32(&self.payload[4..8]),
            BigEndian::read_u32(&self.payload[8..12]),
        ))
    }
}

/// Encodes a frame, where `None` is the 4-byte keep-alive.
pub fn encode_frame(msg: Option<&Message>) -> Vec<u8> {
    match msg {
        Some(msg) => msg.encode(),
        None => vec![0u8; 4],
    }
}

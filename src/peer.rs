use std::net::SocketAddr;
use std::time::Duration;

use bit_vec::BitVec;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::message::{decode_handshake, encode_handshake, Message, MessageId};

pub type PeerAddr = SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Handshaking,
    /// Handshake done, peer has not unchoked us yet.
    Idle,
    Choked,
    Unchoked,
    Closed,
}

/// What a single frame meant for the link.
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    KeepAlive,
    Choke,
    Unchoke,
    Have(u32),
    Bitfield,
    Block {
        index: u32,
        begin: u32,
        data: Vec<u8>,
    },
    /// Valid frame we have no use for.
    Ignored(MessageId),
}

/// One connection to one remote peer.
///
/// Owned by exactly one worker task for its whole life, so none of its
/// state needs synchronization.
pub struct Client<S = TcpStream> {
    addr: PeerAddr,
    conn: S, // contains connection to peer
    state: LinkState,
    // None until the peer tells us what it has
    bitfield: Option<BitVec>,
    piece_count: u32,
    downloaded: u64,
    read_timeout: Duration,
}

impl Client<TcpStream> {
    /// Dials `addr` and performs the handshake, all within `dial_timeout`.
    pub async fn connect(
        addr: PeerAddr,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
        piece_count: u32,
        dial_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        timeout(
            dial_timeout,
            Self::dial(addr, info_hash, peer_id, piece_count, read_timeout),
        )
        .await?
    }

    async fn dial(
        addr: PeerAddr,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
        piece_count: u32,
        read_timeout: Duration,
    ) -> Result<Self> {
        let conn = TcpStream::connect(addr).await?;
        conn.set_nodelay(true)?;
        Client::handshake(addr, conn, info_hash, peer_id, piece_count, read_timeout).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    /// Wraps an already handshaken stream for a torrent of `piece_count` pieces.
    pub fn new(addr: PeerAddr, conn: S, piece_count: u32, read_timeout: Duration) -> Self {
        Client {
            addr,
            conn,
            state: LinkState::Idle,
            bitfield: None,
            piece_count,
            downloaded: 0,
            read_timeout,
        }
    }

    /// Exchanges handshakes over `conn` and verifies the info hash.
    pub async fn handshake(
        addr: PeerAddr,
        conn: S,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
        piece_count: u32,
        read_timeout: Duration,
    ) -> Result<Self> {
        let mut client = Client::new(addr, conn, piece_count, read_timeout);
        client.state = LinkState::Handshaking;

        // send handshake
        let req = encode_handshake(info_hash, peer_id)?;
        client.conn.write_all(&req).await?;

        // recieve handshake
        let res = decode_handshake(&mut client.conn).await?;

        // verify infohash
        if res.info_hash != *info_hash {
            client.state = LinkState::Closed;
            return Err(Error::HandshakeMismatch);
        }

        client.state = LinkState::Idle;
        Ok(client)
    }

    pub fn addr(&self) -> PeerAddr {
        self.addr
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Requests are only worth sending once the peer unchoked us.
    pub fn can_request(&self) -> bool {
        self.state == LinkState::Unchoked
    }

    /// Whether the peer may have piece `index`. Unknown until a bitfield arrives.
    pub fn has_piece(&self, index: u32) -> bool {
        if index >= self.piece_count {
            return false;
        }
        match &self.bitfield {
            Some(bitfield) => bitfield.get(index as usize).unwrap_or(false),
            None => true,
        }
    }

    pub fn bitfield_known(&self) -> bool {
        self.bitfield.is_some()
    }

    /// Block bytes received over the life of the link.
    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let frame = msg.encode();
        match timeout(self.read_timeout, self.conn.write_all(&frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.state = LinkState::Closed;
                Err(e.into())
            }
            Err(_) => {
                self.state = LinkState::Closed;
                Err(Error::Timeout)
            }
        }
    }

    pub async fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        self.send(&Message::request(index, begin, length)).await
    }

    /// Blocks for one frame and applies it to the link state.
    ///
    /// Any failure leaves the link `Closed`; nothing is retried here.
    pub async fn read_next(&mut self) -> Result<Event> {
        let msg = match timeout(self.read_timeout, Message::read(&mut self.conn)).await {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => {
                self.state = LinkState::Closed;
                return Err(e);
            }
            Err(_) => {
                self.state = LinkState::Closed;
                return Err(Error::Timeout);
            }
        };

        let msg = match msg {
            Some(msg) => msg,
            None => return Ok(Event::KeepAlive),
        };

        let event = self.apply(msg);
        if event.is_err() {
            self.state = LinkState::Closed;
        }
        event
    }

    fn apply(&mut self, msg: Message) -> Result<Event> {
        match msg.id {
            MessageId::Choke => {
                self.state = LinkState::Choked;
                Ok(Event::Choke)
            }
            MessageId::Unchoke => {
                self.state = LinkState::Unchoked;
                Ok(Event::Unchoke)
            }
            MessageId::Have => {
                let index = msg.decode_have()?;
                if index >= self.piece_count {
                    return Err(Error::Protocol(format!(
                        "have for piece #{} of {}",
                        index, self.piece_count
                    )));
                }
                if let Some(bitfield) = self.bitfield.as_mut() {
                    bitfield.set(index as usize, true);
                }
                Ok(Event::Have(index))
            }
            MessageId::Bitfield => {
                let count = self.piece_count as usize;
                let max_len = (count + 7) / 8;
                if msg.payload.len() > max_len {
                    return Err(Error::Protocol(format!(
                        "bitfield of {} bytes for {} pieces",
                        msg.payload.len(),
                        count
                    )));
                }
                // short bitfields are padded, spare bits dropped
                let mut bitfield = BitVec::from_bytes(&msg.payload);
                if bitfield.len() < count {
                    bitfield.grow(count - bitfield.len(), false);
                }
                bitfield.truncate(count);
                self.bitfield = Some(bitfield);
                Ok(Event::Bitfield)
            }
            MessageId::Piece => {
                let (index, begin, data) = msg.decode_piece()?;
                self.downloaded += data.len() as u64;
                Ok(Event::Block {
                    index,
                    begin,
                    data: data.to_vec(),
                })
            }
            other => Ok(Event::Ignored(other)),
        }
    }

    /// Shuts the connection down; the link is unusable afterwards.
    pub async fn close(&mut self) {
        self.state = LinkState::Closed;
        if let Err(e) = self.conn.shutdown().await {
            debug!("shutdown of {} failed: {}", self.addr, e);
        }
    }
}

use std::sync::Arc;

use bit_vec::BitVec;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::{Message, MessageId};
use crate::peer::{Client, Event};
use crate::peer_set::PeerSet;
use crate::piece::{PieceResult, PieceWork, WorkQueue};

/// Hands pieces from the shared queue to per-peer workers and collects
/// finished pieces on the result channel.
///
/// Workers share nothing but the queue and the result sender; everything
/// about an individual download lives on the worker's stack.
pub struct Scheduler<S = TcpStream> {
    queue: Arc<WorkQueue>,
    results: UnboundedSender<PieceResult>,
    peers: PeerSet<S>,
    config: Arc<Config>,
    cancel: CancellationToken,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Scheduler<S> {
    pub fn new(
        queue: Arc<WorkQueue>,
        results: UnboundedSender<PieceResult>,
        peers: PeerSet<S>,
        config: Arc<Config>,
        cancel: CancellationToken,
    ) -> Self {
        Scheduler {
            queue,
            results,
            peers,
            config,
            cancel,
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Downloads pieces from one peer until it fails or the session is cancelled.
    ///
    /// On failure the piece in hand goes back on the queue, the peer leaves
    /// the peer set and the connection is closed. Reconnecting is left to
    /// the next tracker refresh.
    pub async fn run_worker(&self, mut client: Client<S>) -> Result<()> {
        let addr = client.addr();
        let res = self.work(&mut client).await;

        self.peers.remove(&addr);
        client.close().await;

        match res {
            Ok(()) | Err(Error::Cancelled) => {
                debug!(
                    "worker for {} finished after {} bytes",
                    addr,
                    client.downloaded()
                );
                Ok(())
            }
            Err(error) => {
                warn!("Disconnecting from {} with error ({})", addr, error);
                Err(error)
            }
        }
    }

    async fn work(&self, client: &mut Client<S>) -> Result<()> {
        client.send(&Message::new(MessageId::Unchoke)).await?;
        client.send(&Message::new(MessageId::Interested)).await?;

        // pieces put back in a row because this peer lacks them
        let mut skipped = 0usize;
        while let Some(pw) = self.queue.pop(&self.cancel).await {
            if !client.has_piece(pw.index) {
                self.queue.push(pw);
                skipped += 1;
                // a whole pass over the queue found nothing this peer has
                if skipped >= self.queue.len() {
                    self.wait_for_news(client).await?;
                    skipped = 0;
                }
                continue;
            }
            skipped = 0;

            // Download the piece
            let buf = match self.attempt_download_piece(client, &pw).await {
                Ok(Some(buf)) => buf,
                Ok(None) => {
                    self.queue.push(pw);
                    continue;
                }
                Err(error) => {
                    self.queue.push(pw);
                    return Err(error);
                }
            };

            // check integrity of the piece
            if self.config.verify_pieces && !check_integrity(&pw, &buf) {
                let index = pw.index;
                self.queue.push(pw);
                return Err(Error::HashMismatch { index });
            }

            // add piece to result
            let index = pw.index;
            if self.results.send(PieceResult { index, buf }).is_err() {
                self.queue.push(pw);
                return Err(Error::Cancelled);
            }

            // notify peer that we have the piece
            client.send(&Message::have(index)).await?;
        }
        Ok(())
    }

    /// Waits for one frame from a peer that has nothing we want right now.
    async fn wait_for_news(&self, client: &mut Client<S>) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            event = client.read_next() => match event? {
                Event::Block { index, begin, .. } => {
                    debug!("unrequested block {}:{} from {}", index, begin, client.addr());
                    Ok(())
                }
                _ => Ok(()),
            },
        }
    }

    /// Pipelines block requests for `pw` and assembles the replies.
    ///
    /// `Ok(None)` means the peer's bitfield showed it lacks the piece before
    /// anything was requested.
    async fn attempt_download_piece(
        &self,
        client: &mut Client<S>,
        pw: &PieceWork,
    ) -> Result<Option<Vec<u8>>> {
        let max_backlog = self.config.max_backlog;
        let max_blocksize = self.config.block_size;

        let mut downloaded = 0u32;
        let mut backlog = 0u32;
        let mut requested = 0u32;

        let mut buf = vec![0u8; pw.len as usize];
        let blocks = ((pw.len + max_blocksize - 1) / max_blocksize) as usize;
        let mut received = BitVec::from_elem(blocks, false);

        while downloaded < pw.len {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if client.can_request() {
                // if unchoked, send requests untill we have enough unfulfilled requests
                while backlog < max_backlog && requested < pw.len {
                    // Last block might be shorter than the max blocksize
                    let blocksize = max_blocksize.min(pw.len - requested);
                    client.send_request(pw.index, requested, blocksize).await?;

                    backlog += 1;
                    requested += blocksize;
                }
            }

            match client.read_next().await? {
                Event::Block { index, begin, data } => {
                    // compare both index
                    if index != pw.index {
                        return Err(Error::Protocol(format!(
                            "expected index {}, got {}",
                            pw.index, index
                        )));
                    }
                    if begin % max_blocksize != 0 || begin >= requested {
                        return Err(Error::Protocol(format!(
                            "unrequested block {}:{} from {}",
                            index,
                            begin,
                            client.addr()
                        )));
                    }
                    let block = (begin / max_blocksize) as usize;
                    if received[block] {
                        debug!("duplicate block {}:{} from {}", index, begin, client.addr());
                        continue;
                    }
                    let expected = max_blocksize.min(pw.len - begin) as usize;
                    if data.len() != expected {
                        return Err(Error::Protocol(format!(
                            "block {}:{} has {} bytes, asked for {}",
                            index,
                            begin,
                            data.len(),
                            expected
                        )));
                    }
                    let begin = begin as usize;
                    buf[begin..begin + expected].copy_from_slice(&data);
                    received.set(block, true);
                    downloaded += expected as u32;
                    backlog -= 1;
                }
                Event::Bitfield if backlog == 0 && !client.has_piece(pw.index) => {
                    return Ok(None);
                }
                _ => {}
            }
        }

        Ok(Some(buf))
    }
}

fn check_integrity(pw: &PieceWork, buf: &[u8]) -> bool {
    let hash: [u8; 20] = Sha1::digest(buf).into();
    hash == pw.hash
}

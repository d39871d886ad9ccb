use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bit_vec::BitVec;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metainfo::Torrent;
use crate::peer::{Client, PeerAddr};
use crate::peer_set::PeerSet;
use crate::piece::{piece_count, PieceResult, WorkQueue};
use crate::scheduler::Scheduler;
use crate::tracker::{request_peers, Announce};
use crate::writer::FileWriter;

/// What a finished session leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub name: String,
    pub path: PathBuf,
    pub pieces: usize,
    pub bytes: u64,
}

/// Downloads one torrent into one file.
pub struct TorrentSession<A> {
    torrent: Arc<Torrent>,
    config: Arc<Config>,
    tracker: Arc<A>,
    output: PathBuf,
}

impl<A: Announce + 'static> TorrentSession<A> {
    pub fn new(torrent: Arc<Torrent>, config: Arc<Config>, tracker: Arc<A>, output: PathBuf) -> Self {
        TorrentSession {
            torrent,
            config,
            tracker,
            output,
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Runs until every piece is on disk, `cancel` fires, or the output
    /// file fails.
    ///
    /// Peer and tracker trouble is logged and survived; a bad output file
    /// or inconsistent metadata ends the session.
    pub async fn run(self, cancel: CancellationToken) -> Result<Summary> {
        let torrent = self.torrent.clone();
        let config = self.config.clone();

        let expected = piece_count(torrent.piece_len, torrent.file_len);
        if torrent.piece_len == 0 || torrent.pieces.len() != expected {
            return Err(Error::MalformedMetadata(format!(
                "{} has {} piece hashes, expected {}",
                torrent.name,
                torrent.pieces.len(),
                expected
            )));
        }

        let writer = FileWriter::create(&self.output, torrent.file_len, torrent.piece_len)
            .await
            .map_err(|e| {
                error!("could not create {}: {}", self.output.display(), e);
                e
            })?;

        info!(
            "Starting download for {} ({} pieces, info hash {})",
            torrent.name,
            torrent.pieces.len(),
            hex::encode(torrent.info_hash)
        );

        let queue = Arc::new(WorkQueue::new());
        for pw in torrent.piece_work() {
            queue.push(pw);
        }

        let token = cancel.child_token();
        // bytes not yet on disk, reported to the tracker as `left`
        let remaining = Arc::new(AtomicU64::new(torrent.file_len));
        let (result_tx, result_rx) = unbounded_channel::<PieceResult>();
        let (peers, incoming) = PeerSet::new();
        let scheduler = Arc::new(Scheduler::new(
            queue,
            result_tx,
            peers.clone(),
            config.clone(),
            token.clone(),
        ));

        tokio::spawn(dispatch(scheduler, incoming, token.clone()));
        let mut committer = tokio::spawn(commit(
            writer,
            result_rx,
            torrent.clone(),
            peers.clone(),
            remaining.clone(),
            token.clone(),
        ));

        // first tick fires immediately
        let mut refresh = tokio::time::interval(config.refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                res = &mut committer => break res.map_err(Error::from).and_then(|r| r),
                _ = token.cancelled() => break Err(Error::Cancelled),
                _ = refresh.tick() => {
                    tokio::spawn(enclose! { (torrent, config, peers, remaining, token) {
                        let tracker = self.tracker.clone();
                        async move {
                            let left = remaining.load(Ordering::SeqCst);
                            refresh_peers(torrent, config, tracker, peers, left, token).await
                        }
                    }});
                }
            }
        };

        // stop workers, dialers and the dispatcher
        token.cancel();

        match &outcome {
            Ok(summary) => info!(
                "Finished {} ({} bytes) into {}",
                summary.name,
                summary.bytes,
                summary.path.display()
            ),
            Err(Error::Cancelled) => info!("Download of {} cancelled", torrent.name),
            Err(e) => error!("Download of {} failed: {}", torrent.name, e),
        }
        outcome
    }
}

/// Spawns one worker per link that makes it into the peer set.
async fn dispatch(
    scheduler: Arc<Scheduler>,
    mut incoming: UnboundedReceiver<Client>,
    token: CancellationToken,
) {
    loop {
        let client = tokio::select! {
            _ = token.cancelled() => break,
            client = incoming.recv() => match client {
                Some(client) => client,
                None => break,
            },
        };
        debug!("starting worker for {}", client.addr());
        tokio::spawn(enclose! { (scheduler) async move {
            // failures are logged by the worker itself
            let _ = scheduler.run_worker(client).await;
        }});
    }
}

/// Drains finished pieces into the output file.
async fn commit(
    mut writer: FileWriter,
    mut results: UnboundedReceiver<PieceResult>,
    torrent: Arc<Torrent>,
    peers: PeerSet,
    remaining: Arc<AtomicU64>,
    token: CancellationToken,
) -> Result<Summary> {
    let total = torrent.pieces.len();
    let mut done = BitVec::from_elem(total, false);
    let mut downloaded_pieces = 0;
    let mut bytes = 0u64;

    while downloaded_pieces < total {
        let res = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            res = results.recv() => res.ok_or(Error::Cancelled)?,
        };

        let index = res.index as usize;
        if index >= total || done[index] {
            debug!("ignoring duplicate piece #{}", res.index);
            continue;
        }

        if let Err(e) = writer.write(&res).await {
            error!(
                "could not write piece #{} to {}: {}",
                res.index,
                writer.path().display(),
                e
            );
            return Err(e);
        }
        done.set(index, true);
        downloaded_pieces += 1;
        bytes += res.buf.len() as u64;
        remaining.fetch_sub(res.buf.len() as u64, Ordering::SeqCst);

        let percent = (downloaded_pieces as f64 / total as f64) * 100.0;
        info!(
            "({:.2}%) Downloaded piece #{:?} from {:?} peers",
            percent,
            res.index,
            peers.len()
        );
    }

    writer.finish().await?;
    Ok(Summary {
        name: torrent.name.clone(),
        path: writer.path().to_path_buf(),
        pieces: total,
        bytes,
    })
}

/// Announces once and dials every peer we are not already talking to.
async fn refresh_peers<A: Announce + 'static>(
    torrent: Arc<Torrent>,
    config: Arc<Config>,
    tracker: Arc<A>,
    peers: PeerSet,
    left: u64,
    token: CancellationToken,
) {
    let response = tokio::select! {
        _ = token.cancelled() => return,
        res = request_peers(&*tracker, &torrent, &config.peer_id, config.port, left) => match res {
            Ok(response) => response,
            Err(e) => {
                warn!("peer refresh for {} skipped ({})", torrent.name, e);
                return;
            }
        },
    };

    for addr in response.peers {
        if peers.contains(&addr) {
            continue;
        }
        tokio::spawn(enclose! { (torrent, config, peers, token) {
            connect_peer(addr, torrent, config, peers, token)
        }});
    }
}

async fn connect_peer(
    addr: PeerAddr,
    torrent: Arc<Torrent>,
    config: Arc<Config>,
    peers: PeerSet,
    token: CancellationToken,
) {
    let res = tokio::select! {
        _ = token.cancelled() => return,
        res = Client::connect(
            addr,
            &torrent.info_hash,
            &config.peer_id,
            torrent.pieces.len() as u32,
            config.dial_timeout,
            config.read_timeout,
        ) => res,
    };

    match res {
        Ok(client) => {
            if peers.try_add(addr, client) {
                debug!("connected to {}", addr);
            } else {
                debug!("already connected to {}", addr);
            }
        }
        Err(e) => warn!("failed to connect to peer {} ({})", addr, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackerResponse;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NoPeers;

    #[async_trait]
    impl Announce for NoPeers {
        async fn announce(
            &self,
            _url: &str,
            _torrent: &Torrent,
            _peer_id: &[u8; 20],
            _port: u16,
            _left: u64,
        ) -> Result<TrackerResponse> {
            Ok(TrackerResponse {
                interval: 60,
                peers: vec![],
            })
        }
    }

    fn torrent() -> Torrent {
        Torrent::new(
            vec!["http://tracker.example/announce".into()],
            [0u8; 20],
            vec![[0u8; 20]; 4],
            16,
            64,
            "four.bin".into(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_commit_counts_down_remaining_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = Arc::new(torrent());
        let writer = FileWriter::create(&dir.path().join("four.bin"), 64, 16)
            .await
            .unwrap();
        let (tx, rx) = unbounded_channel();
        let (peers, _incoming) = PeerSet::new();
        let remaining = Arc::new(AtomicU64::new(64));

        let committer = tokio::spawn(commit(
            writer,
            rx,
            torrent,
            peers,
            remaining.clone(),
            CancellationToken::new(),
        ));

        let piece = |index: u32| PieceResult {
            index,
            buf: vec![index as u8; 16],
        };
        tx.send(piece(2)).unwrap();
        tx.send(piece(2)).unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while remaining.load(Ordering::SeqCst) != 48 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        for index in [0, 3, 1] {
            tx.send(piece(index)).unwrap();
        }
        let summary = committer.await.unwrap().unwrap();
        assert_eq!(summary.bytes, 64);
        assert_eq!(remaining.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_session() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("four.bin");
        let session = TorrentSession::new(
            Arc::new(torrent()),
            Arc::new(Config::default()),
            Arc::new(NoPeers),
            output.clone(),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(session.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let res = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(Error::Cancelled)));
        // the file was created and sized up front
        assert_eq!(tokio::fs::metadata(&output).await.unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_inconsistent_metadata_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut bad = torrent();
        bad.pieces.pop();
        let session = TorrentSession::new(
            Arc::new(bad),
            Arc::new(Config::default()),
            Arc::new(NoPeers),
            dir.path().join("bad.bin"),
        );

        let res = session.run(CancellationToken::new()).await;
        assert!(matches!(res, Err(Error::MalformedMetadata(_))));
    }

    #[tokio::test]
    async fn test_unwritable_destination_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let session = TorrentSession::new(
            Arc::new(torrent()),
            Arc::new(Config::default()),
            Arc::new(NoPeers),
            dir.path().join("no").join("such").join("dir.bin"),
        );

        let res = session.run(CancellationToken::new()).await;
        assert!(matches!(res, Err(Error::Io(_))));
    }
}

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use wiretorrent::message::{decode_handshake, encode_handshake, Message, MessageId};
use wiretorrent::{Announce, Config, DownloadManager, Error, Result, Torrent, TrackerResponse};

const INFO_HASH: [u8; 20] = [7u8; 20];
const PIECE_LEN: u32 = 16;

fn content() -> Vec<u8> {
    (0..64u8).map(|b| b.wrapping_mul(31).wrapping_add(3)).collect()
}

fn torrent(name: &str, data: &[u8]) -> Torrent {
    let pieces: Vec<[u8; 20]> = data
        .chunks(PIECE_LEN as usize)
        .map(|chunk| Sha1::digest(chunk).into())
        .collect();
    Torrent::new(
        vec!["http://tracker.example/announce".into()],
        INFO_HASH,
        pieces,
        PIECE_LEN,
        data.len() as u64,
        name.into(),
    )
    .unwrap()
}

fn config(dir: &std::path::Path) -> Config {
    Config {
        dial_timeout: Duration::from_secs(1),
        read_timeout: Duration::from_secs(5),
        refresh_interval: Duration::from_millis(100),
        output_dir: dir.to_path_buf(),
        ..Config::default()
    }
}

/// A seeder that accepts one connection and serves `data` until asked for
/// `stop_at`, at which point it hangs up.
async fn seeder(
    data: Arc<Vec<u8>>,
    stop_at: Option<u32>,
    dropped: Arc<AtomicBool>,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut conn, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(_) => return,
        };
        drop(listener);

        let hs = decode_handshake(&mut conn).await.unwrap();
        assert_eq!(hs.info_hash, INFO_HASH);
        let reply = encode_handshake(&INFO_HASH, &[9u8; 20]).unwrap();
        if conn.write_all(&reply).await.is_err() {
            return;
        }
        if conn
            .write_all(&Message::new(MessageId::Unchoke).encode())
            .await
            .is_err()
        {
            return;
        }

        loop {
            let msg = match Message::read(&mut conn).await {
                Ok(Some(msg)) => msg,
                Ok(None) => continue,
                Err(_) => break,
            };
            if msg.id != MessageId::Request {
                continue;
            }
            let (index, begin, length) = msg.decode_request().unwrap();
            if Some(index) == stop_at {
                dropped.store(true, Ordering::SeqCst);
                break;
            }
            let start = (index * PIECE_LEN + begin) as usize;
            let block = &data[start..start + length as usize];
            if conn
                .write_all(&Message::piece(index, begin, block).encode())
                .await
                .is_err()
            {
                break;
            }
        }
    });

    addr
}

/// Hands out the first peer until it has hung up, the second one after.
struct HandOver {
    first: SocketAddr,
    second: SocketAddr,
    first_dropped: Arc<AtomicBool>,
    announces: AtomicUsize,
}

#[async_trait]
impl Announce for HandOver {
    async fn announce(
        &self,
        _url: &str,
        _torrent: &Torrent,
        _peer_id: &[u8; 20],
        _port: u16,
        _left: u64,
    ) -> Result<TrackerResponse> {
        self.announces.fetch_add(1, Ordering::SeqCst);
        let peer = if self.first_dropped.load(Ordering::SeqCst) {
            self.second
        } else {
            self.first
        };
        Ok(TrackerResponse {
            interval: 1,
            peers: vec![peer],
        })
    }
}

#[tokio::test]
#[traced_test]
async fn test_download_survives_peer_drop() {
    let dir = tempfile::tempdir().unwrap();
    let data = Arc::new(content());

    let first_dropped = Arc::new(AtomicBool::new(false));
    let first = seeder(data.clone(), Some(3), first_dropped.clone()).await;
    let second = seeder(data.clone(), None, Arc::new(AtomicBool::new(false))).await;

    let tracker = HandOver {
        first,
        second,
        first_dropped,
        announces: AtomicUsize::new(0),
    };
    let mut manager = DownloadManager::new(config(dir.path()), tracker);
    manager.add(torrent("four.bin", &data));

    let results = tokio::time::timeout(
        Duration::from_secs(10),
        manager.run(CancellationToken::new()),
    )
    .await
    .unwrap();

    assert_eq!(results.len(), 1);
    let (name, res) = &results[0];
    assert_eq!(name, "four.bin");
    let summary = res.as_ref().unwrap();
    assert_eq!(summary.pieces, 4);
    assert_eq!(summary.bytes, 64);
    assert_eq!(summary.path, dir.path().join("four.bin"));

    let written = tokio::fs::read(dir.path().join("four.bin")).await.unwrap();
    assert_eq!(written, *data);
}

/// Always announces the same single peer.
struct Fixed {
    peer: SocketAddr,
}

#[async_trait]
impl Announce for Fixed {
    async fn announce(
        &self,
        _url: &str,
        _torrent: &Torrent,
        _peer_id: &[u8; 20],
        _port: u16,
        _left: u64,
    ) -> Result<TrackerResponse> {
        Ok(TrackerResponse {
            interval: 1,
            peers: vec![self.peer],
        })
    }
}

#[tokio::test]
#[traced_test]
async fn test_repeated_announces_reuse_connection() {
    let dir = tempfile::tempdir().unwrap();
    let data = Arc::new(content());

    // accepts exactly once, so a second dial would never be served
    let peer = seeder(data.clone(), None, Arc::new(AtomicBool::new(false))).await;

    let mut manager = DownloadManager::new(config(dir.path()), Fixed { peer });
    manager.add(torrent("once.bin", &data));

    let results = tokio::time::timeout(
        Duration::from_secs(10),
        manager.run(CancellationToken::new()),
    )
    .await
    .unwrap();

    assert!(results[0].1.is_ok());
    let written = tokio::fs::read(dir.path().join("once.bin")).await.unwrap();
    assert_eq!(written, *data);
}

#[tokio::test]
async fn test_cancel_without_peers() {
    let dir = tempfile::tempdir().unwrap();
    let data = content();

    // nothing listens here once the listener is gone
    let gone = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let mut manager = DownloadManager::new(config(dir.path()), Fixed { peer: gone });
    manager.add(torrent("never.bin", &data));

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        stopper.cancel();
    });

    let results = tokio::time::timeout(Duration::from_secs(5), manager.run(cancel))
        .await
        .unwrap();
    assert!(matches!(results[0].1, Err(Error::Cancelled)));
}

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde_bytes::ByteBuf;

use crate::error::{Error, Result};
use crate::metainfo::Torrent;
use crate::peer::PeerAddr;

const PEER_SIZE: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerResponse {
    /// Seconds the tracker wants between announces.
    pub interval: u32,
    pub peers: Vec<PeerAddr>,
}

#[derive(Debug, Deserialize)]
struct BencodeTrackerResp {
    #[serde(default)]
    interval: Option<i64>,
    #[serde(default)]
    peers: Option<ByteBuf>,
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
}

/// Something that can tell us who else is sharing a torrent.
#[async_trait]
pub trait Announce: Send + Sync {
    async fn announce(
        &self,
        url: &str,
        torrent: &Torrent,
        peer_id: &[u8; 20],
        port: u16,
        left: u64,
    ) -> Result<TrackerResponse>;
}

fn build_query_string<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<String>>()
        .join("&")
}

pub fn build_tracker_url(
    announce: &str,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    left: u64,
) -> Result<String> {
    reqwest::Url::parse(announce)
        .map_err(|e| Error::Tracker(format!("could not parse tracker url {}: {}", announce, e)))?;

    // represent binary data as url-encoded strings
    let info_hash = percent_encode(info_hash, NON_ALPHANUMERIC).to_string();
    let peer_id = percent_encode(peer_id, NON_ALPHANUMERIC).to_string();
    let port = port.to_string();
    let left = left.to_string();

    let query = build_query_string([
        ("compact", "1"),
        ("downloaded", "0"),
        ("info_hash", info_hash.as_str()),
        ("left", left.as_str()),
        ("peer_id", peer_id.as_str()),
        ("port", port.as_str()),
        ("uploaded", "0"),
    ]);

    let separator = if announce.contains('?') { '&' } else { '?' };
    Ok(format!("{}{}{}", announce, separator, query))
}

/// Splits the compact `<ip:4><port:2>` peer list.
pub fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<PeerAddr>> {
    if bytes.len() % PEER_SIZE != 0 {
        return Err(Error::MalformedMetadata(format!(
            "peer list of {} bytes is not a multiple of {}",
            bytes.len(),
            PEER_SIZE
        )));
    }
    Ok(bytes
        .chunks_exact(PEER_SIZE)
        .map(|x| {
            let ip = Ipv4Addr::new(x[0], x[1], x[2], x[3]);
            SocketAddr::new(IpAddr::V4(ip), BigEndian::read_u16(&x[4..]))
        })
        .collect())
}

pub fn parse_response(bytes: &[u8]) -> Result<TrackerResponse> {
    let response: BencodeTrackerResp = serde_bencode::from_bytes(bytes)
        .map_err(|e| Error::Tracker(format!("malformed tracker response: {}", e)))?;

    if let Some(reason) = response.failure_reason {
        return Err(Error::Tracker(format!("tracker refused: {}", reason)));
    }
    let peers = match response.peers {
        Some(peers) => parse_compact_peers(&peers)?,
        None => return Err(Error::Tracker("tracker response has no peers".into())),
    };
    let interval = response
        .interval
        .and_then(|i| u32::try_from(i).ok())
        .unwrap_or(0);

    Ok(TrackerResponse { interval, peers })
}

/// Announces over HTTP(S).
pub struct HttpTracker {
    client: reqwest::Client,
}

impl HttpTracker {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Tracker(format!("could not build http client: {}", e)))?;
        Ok(HttpTracker { client })
    }
}

#[async_trait]
impl Announce for HttpTracker {
    async fn announce(
        &self,
        url: &str,
        torrent: &Torrent,
        peer_id: &[u8; 20],
        port: u16,
        left: u64,
    ) -> Result<TrackerResponse> {
        let tracker_url = build_tracker_url(url, &torrent.info_hash, peer_id, port, left)?;

        let resp = self
            .client
            .get(&tracker_url)
            .send()
            .await
            .map_err(|e| Error::Tracker(format!("announce to {} failed: {}", url, e)))?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(Error::Tracker(format!("bad status: {}", resp.status())));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::Tracker(format!("reading response from {}: {}", url, e)))?;

        parse_response(&bytes)
    }
}

/// Tries every announce URL in order; the first one that answers wins.
pub async fn request_peers<A: Announce + ?Sized>(
    tracker: &A,
    torrent: &Torrent,
    peer_id: &[u8; 20],
    port: u16,
    left: u64,
) -> Result<TrackerResponse> {
    if torrent.announce_list.is_empty() {
        return Err(Error::Tracker("torrent has no announce urls".into()));
    }
    for url in &torrent.announce_list {
        match tracker.announce(url, torrent, peer_id, port, left).await {
            Ok(response) => {
                debug!("{} returned {} peers", url, response.peers.len());
                return Ok(response);
            }
            Err(error) => warn!("announce to {} failed ({})", url, error),
        }
    }
    Err(Error::Tracker("could not get peers from any tracker".into()))
}

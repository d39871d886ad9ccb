use std::path::Path;

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::piece::{piece_count, piece_size, PieceWork};

const SHA1_HASH_SIZE: usize = 20;

#[derive(Debug, Deserialize, Serialize)]
struct BencodeInfo {
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<i64>,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    md5sum: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BencodeTorrent {
    info: BencodeInfo,
    #[serde(default)]
    announce: Option<String>,
    #[serde(rename = "announce-list", default)]
    announce_list: Option<Vec<Vec<String>>>,
}

// A flat structure for working with single torrent files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Torrent {
    /// Tracker URLs in the order they should be tried.
    pub announce_list: Vec<String>,
    pub info_hash: [u8; 20],
    pub pieces: Vec<[u8; 20]>,
    pub piece_len: u32,
    pub file_len: u64,
    pub name: String,
}

impl Torrent {
    /// Builds a torrent from already decoded parts, checking that the piece
    /// hashes cover the file exactly.
    pub fn new(
        announce_list: Vec<String>,
        info_hash: [u8; 20],
        pieces: Vec<[u8; 20]>,
        piece_len: u32,
        file_len: u64,
        name: String,
    ) -> Result<Self> {
        if piece_len == 0 {
            return Err(Error::MalformedMetadata("piece length is 0".into()));
        }
        let expected = piece_count(piece_len, file_len);
        if pieces.len() != expected {
            return Err(Error::MalformedMetadata(format!(
                "{} piece hashes for {} bytes in pieces of {}, expected {}",
                pieces.len(),
                file_len,
                piece_len,
                expected
            )));
        }
        Ok(Torrent {
            announce_list,
            info_hash,
            pieces,
            piece_len,
            file_len,
            name,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let torrent: BencodeTorrent = serde_bencode::from_bytes(bytes)
            .map_err(|e| Error::MalformedMetadata(format!("could not decode torrent: {}", e)))?;

        // calculate sha1 hash for Torrent info
        let info_bytes = serde_bencode::to_bytes(&torrent.info)
            .map_err(|e| Error::MalformedMetadata(format!("could not encode info: {}", e)))?;
        let info_hash: [u8; 20] = Sha1::digest(info_bytes).into();

        let info = torrent.info;
        if info.pieces.len() % SHA1_HASH_SIZE != 0 {
            return Err(Error::MalformedMetadata(format!(
                "pieces field of {} bytes is not a multiple of {}",
                info.pieces.len(),
                SHA1_HASH_SIZE
            )));
        }
        // split pieces into slice of hashes where each slice is 20 bytes
        let pieces = info
            .pieces
            .chunks_exact(SHA1_HASH_SIZE)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let file_len = match info.length {
            Some(len) if len >= 0 => len as u64,
            Some(len) => {
                return Err(Error::MalformedMetadata(format!("negative length {}", len)))
            }
            None => {
                return Err(Error::MalformedMetadata(
                    "multi-file torrents are not supported".into(),
                ))
            }
        };
        let piece_len = u32::try_from(info.piece_length).map_err(|_| {
            Error::MalformedMetadata(format!("piece length {} out of range", info.piece_length))
        })?;

        // announce-list tiers take precedence, the plain announce is the fallback
        let mut announce_list: Vec<String> = Vec::new();
        let tiers = torrent.announce_list.unwrap_or_default();
        for url in tiers.into_iter().flatten().chain(torrent.announce) {
            if !url.is_empty() && !announce_list.contains(&url) {
                announce_list.push(url);
            }
        }

        Torrent::new(
            announce_list,
            info_hash,
            pieces,
            piece_len,
            file_len,
            info.name,
        )
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Torrent::from_bytes(&bytes)
    }

    pub fn piece_size(&self, index: u32) -> u32 {
        piece_size(index, self.piece_len, self.file_len)
    }

    /// One work item per piece, in index order.
    pub fn piece_work(&self) -> impl Iterator<Item = PieceWork> + '_ {
        self.pieces.iter().enumerate().map(|(i, &hash)| PieceWork {
            index: i as u32,
            hash,
            len: self.piece_size(i as u32),
        })
    }
}

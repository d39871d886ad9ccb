use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;

pub const PORT: u16 = 6881;
pub const MAX_BACKLOG: u32 = 5;
pub const MAX_BLOCKSIZE: u32 = 16384;

lazy_static! {
    /// This is an random id generated once at runtime
    pub static ref RANDOM_ID: [u8; 20] = {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(b"-WT0100-");
        let mut rng = rand::thread_rng();
        for b in id[8..].iter_mut() {
            *b = rng.sample(rand::distributions::Alphanumeric);
        }
        id
    };
}

/// Knobs shared by every session of a download.
#[derive(Debug, Clone)]
pub struct Config {
    pub peer_id: [u8; 20],
    /// Port announced to trackers. Nothing listens on it.
    pub port: u16,
    pub dial_timeout: Duration,
    /// Idle bound on a single frame read; dead peers are dropped after it.
    pub read_timeout: Duration,
    pub refresh_interval: Duration,
    /// Unanswered requests allowed in flight to one peer.
    pub max_backlog: u32,
    pub block_size: u32,
    pub verify_pieces: bool,
    pub output_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            peer_id: *RANDOM_ID,
            port: PORT,
            dial_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(120),
            refresh_interval: Duration::from_secs(60),
            max_backlog: MAX_BACKLOG,
            block_size: MAX_BLOCKSIZE,
            verify_pieces: true,
            output_dir: PathBuf::from("."),
        }
    }
}

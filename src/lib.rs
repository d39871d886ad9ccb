extern crate serde;
extern crate serde_bencode;
#[macro_use]
extern crate serde_derive;
extern crate serde_bytes;

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate log;

// https://github.com/rust-webplatform/rust-todomvc/blob/51cbd62e906a6274d951fd7a8f5a6c33fcf8e7ea/src/main.rs#L34-L41
macro_rules! enclose {
    ( ($( $x:ident ),*) $y:expr ) => {
        {
            $(let $x = $x.clone();)*
            $y
        }
    };
}

pub mod config;
pub mod error;
pub mod manager;
pub mod message;
pub mod metainfo;
pub mod peer;
pub mod peer_set;
pub mod piece;
pub mod scheduler;
pub mod session;
pub mod tracker;
pub mod writer;

pub use config::Config;
pub use error::{Error, Result};
pub use manager::DownloadManager;
pub use metainfo::Torrent;
pub use peer::{Client, PeerAddr};
pub use peer_set::PeerSet;
pub use piece::{PieceResult, PieceWork, WorkQueue};
pub use scheduler::Scheduler;
pub use session::{Summary, TorrentSession};
pub use tracker::{Announce, HttpTracker, TrackerResponse};
pub use writer::FileWriter;

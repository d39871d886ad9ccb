use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::metainfo::Torrent;
use crate::session::{Summary, TorrentSession};
use crate::tracker::Announce;

/// Runs one session per torrent, all at once.
pub struct DownloadManager<A> {
    config: Arc<Config>,
    tracker: Arc<A>,
    torrents: Vec<Arc<Torrent>>,
}

impl<A: Announce + 'static> DownloadManager<A> {
    pub fn new(config: Config, tracker: A) -> Self {
        DownloadManager {
            config: Arc::new(config),
            tracker: Arc::new(tracker),
            torrents: vec![],
        }
    }

    pub fn add(&mut self, torrent: Torrent) {
        self.torrents.push(Arc::new(torrent));
    }

    pub async fn add_file(&mut self, path: &Path) -> Result<()> {
        let torrent = Torrent::from_file(path).await?;
        info!("Loaded {} from {}", torrent.name, path.display());
        self.add(torrent);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.torrents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.torrents.is_empty()
    }

    /// Output files, one per torrent and never shared.
    pub fn output_paths(&self) -> Vec<PathBuf> {
        let mut taken = HashSet::new();
        self.torrents
            .iter()
            .map(|torrent| {
                let name = sanitize_filename(&torrent.name);
                let mut path = self.config.output_dir.join(&name);
                let mut n = 1;
                while !taken.insert(path.clone()) {
                    path = self.config.output_dir.join(format!("{}.{}", name, n));
                    n += 1;
                }
                path
            })
            .collect()
    }

    /// Downloads every torrent concurrently and reports each outcome by
    /// name, in the order the torrents were added. A failing torrent does
    /// not stop the others; cancelling `cancel` stops them all.
    pub async fn run(&self, cancel: CancellationToken) -> Vec<(String, Result<Summary>)> {
        let sessions = self
            .torrents
            .iter()
            .zip(self.output_paths())
            .map(|(torrent, output)| {
                let session = TorrentSession::new(
                    torrent.clone(),
                    self.config.clone(),
                    self.tracker.clone(),
                    output,
                );
                let name = torrent.name.clone();
                let cancel = cancel.clone();
                async move { (name, session.run(cancel).await) }
            });

        join_all(sessions).await
    }
}

/// Keeps a torrent name from escaping the output directory.
pub fn sanitize_filename(filename: &str) -> String {
    let safe_name = filename.replace(['/', '\\'], "_");

    if safe_name.trim().is_empty() || safe_name == "." || safe_name == ".." {
        "download".to_string()
    } else {
        safe_name
    }
}

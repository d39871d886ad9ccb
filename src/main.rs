use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use wiretorrent::{Config, DownloadManager, HttpTracker};

#[macro_use]
extern crate log;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Paths to the torrent metainfo files.
    #[clap(required = true)]
    torrentfiles: Vec<PathBuf>,

    /// Directory the downloaded files are written to.
    #[clap(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Port announced to the trackers.
    #[clap(short, long, default_value_t = wiretorrent::config::PORT)]
    port: u16,

    #[clap(long, default_value_t = 3)]
    dial_timeout_secs: u64,

    /// Peers silent for this long are dropped.
    #[clap(long, default_value_t = 120)]
    read_timeout_secs: u64,

    /// Seconds between tracker announces.
    #[clap(long, default_value_t = 60)]
    refresh_secs: u64,

    /// Skip the SHA-1 check of finished pieces.
    #[clap(long)]
    no_verify: bool,

    #[clap(long, default_value = "info")]
    log_level: tracing::Level,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_thread_ids(true)
        .with_line_number(true)
        .with_max_level(args.log_level)
        .init();

    let config = Config {
        port: args.port,
        dial_timeout: Duration::from_secs(args.dial_timeout_secs),
        read_timeout: Duration::from_secs(args.read_timeout_secs),
        refresh_interval: Duration::from_secs(args.refresh_secs),
        verify_pieces: !args.no_verify,
        output_dir: args.output_dir,
        ..Config::default()
    };

    let tracker = match HttpTracker::new(Duration::from_secs(15)) {
        Ok(tracker) => tracker,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let mut manager = DownloadManager::new(config, tracker);
    let mut failed = 0;
    for path in &args.torrentfiles {
        if let Err(e) = manager.add_file(path).await {
            error!("could not load {}: {}", path.display(), e);
            failed += 1;
        }
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down");
                cancel.cancel();
            }
        }
    });

    for (name, res) in manager.run(cancel).await {
        match res {
            Ok(summary) => println!(
                "{}: {} pieces, {} bytes -> {}",
                name,
                summary.pieces,
                summary.bytes,
                summary.path.display()
            ),
            Err(e) => {
                println!("{}: failed ({})", name, e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        std::process::exit(1);
    }
}

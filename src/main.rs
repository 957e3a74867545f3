use crate::{
    config::Config,
    error::ApplicationError,
    peer::TcpConnector,
    session::{Session, SessionState},
    storage::StorageSink,
    torrent::Torrent,
    tracker::Tracker,
};

use clap::Parser;
use log::{error, info};
use std::{path::PathBuf, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};

mod config;
mod error;
mod framer;
mod manager;
mod peer;
mod piece;
mod protocol;
mod queue;
mod session;
mod storage;
mod torrent;
mod tracker;

#[derive(Parser, Debug)]
#[command(author, version, about = "Download a single-file torrent from its swarm.")]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Output filename (defaults to the name from the torrent)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Config file (defaults to ~/.config/swarmfetch/config.toml)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    pretty_env_logger::init_timed();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), ApplicationError> {
    let config  = Config::load(args.config.as_deref())?;
    let torrent = Torrent::from_file(&args.torrent)?;
    torrent.log_info();

    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(sanitize_filename(torrent.name())));

    let layout    = torrent.layout(config.block_length);
    let tracker   = Arc::new(Tracker::new(&torrent, config.peer_id(), config.port)?);
    let connector = Arc::new(TcpConnector::new(config.connect_timeout()));
    let sink      = StorageSink::open(&output).await?;
    let session   = Session::new(layout, config, tracker, connector, sink);

    info!("controls: 'p' + enter to pause, 'r' to resume, 'q' to quit");
    let control = tokio::spawn(control_loop(session.clone()));
    let outcome = session.run().await;
    control.abort();

    match outcome? {
        SessionState::Failed(reason) => Err(ApplicationError::SessionError(reason.to_string())),
        SessionState::Completed => {
            info!("saved to {}", output.display());
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Line-based pause/resume/quit controls on stdin, plus Ctrl-C.
async fn control_loop(session: Arc<Session>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                session.shutdown();
                return;
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    // stdin closed; Ctrl-C still works
                    let _ = tokio::signal::ctrl_c().await;
                    session.shutdown();
                    return;
                };
                match line.trim() {
                    "p" | "P" => session.pause().await,
                    "r" | "R" => session.resume().await,
                    "q" | "Q" => {
                        session.shutdown();
                        return;
                    }
                    "" => {}
                    other => info!("unknown command {:?}", other),
                }
            }
        }
    }
}

/// Keeps the torrent's name from escaping the working directory.
fn sanitize_filename(filename: &str) -> String {
    let safe_name = filename.replace(['/', '\\'], "_");
    if safe_name.trim().is_empty() || safe_name == ".." || safe_name == "." {
        "download".to_string()
    } else {
        safe_name
    }
}

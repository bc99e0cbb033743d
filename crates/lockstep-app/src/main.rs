use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use lockstep_core::SessionConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app;

#[derive(Parser, Debug)]
#[command(name = "lockstep")]
#[command(about = "Synchronized video playback across devices on a LAN", version)]
struct Args {
    /// JSON session config (defaults apply when absent)
    #[arg(long, global = true, env = "LOCKSTEP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send videos to slaves and lead playback
    Master {
        /// Directory holding the videos
        #[arg(short, long)]
        dir: PathBuf,

        /// Send only these file names (default: every video in --dir)
        #[arg(short, long)]
        files: Vec<String>,

        /// Number of slaves to wait for before sending
        #[arg(short, long, default_value_t = 1)]
        peers: usize,

        /// Do not advertise over mDNS
        #[arg(long)]
        no_advertise: bool,
    },

    /// Receive videos and follow the master's schedule
    Slave {
        /// Directory to store received videos in
        #[arg(short, long)]
        dir: PathBuf,

        /// Master endpoint (host:port); discovered over mDNS when absent
        #[arg(short, long)]
        master: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG=debug for per-message detail
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_thread_ids(false)
        .init();

    let args = Args::parse();
    info!("Lockstep v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };

    let outcome = match args.command {
        Command::Master {
            dir,
            files,
            peers,
            no_advertise,
        } => app::run_master(config, dir, files, peers, !no_advertise).await,
        Command::Slave { dir, master } => app::run_slave(config, dir, master).await,
    };

    match outcome {
        Ok(()) => {
            info!("Lockstep exited cleanly.");
            Ok(())
        }
        Err(e) => {
            error!("Fatal error: {:#}", e);
            Err(e)
        }
    }
}

//! Command-line argument parsing

use std::path::PathBuf;

use clap::Parser;

use crate::engine::EngineConfig;

/// CLI arguments for the downloader
#[derive(Debug, Parser)]
#[command(name = "btdl")]
#[command(about = "A BitTorrent CLI downloader", long_about = None)]
pub struct CliArgs {
    /// Path to the .torrent file
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent_file: PathBuf,

    /// Download directory
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Listening port for incoming connections
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// Maximum number of peer sessions
    #[arg(short, long, default_value_t = 50)]
    pub max_peers: usize,

    /// Outstanding block requests per peer
    #[arg(long, default_value_t = 5)]
    pub pipeline: usize,

    /// Peers to request per announce
    #[arg(long, default_value_t = 50)]
    pub numwant: u32,

    /// Load and save a resume file
    #[arg(long)]
    pub resume: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }

    /// Engine configuration derived from the flags
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            download_dir: self
                .output_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(".")),
            listen_port: self.port,
            max_sessions: self.max_peers,
            pipeline_depth: self.pipeline,
            numwant: self.numwant,
            resume: self.resume,
            ..Default::default()
        }
    }
}

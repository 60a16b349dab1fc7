//! btdl - main entry point
//!
//! Loads a metainfo file, runs the engine, and paints a 1 Hz progress line
//! until the download completes or the user interrupts.

use anyhow::{Context, Result};
use btdl::cli::progress::{format_bytes, ProgressLine};
use btdl::{CliArgs, Engine, EngineEvent, Metainfo, MetainfoParser, TorrentState};
use tracing::{debug, error, info};

fn init_logging(args: &CliArgs) {
    tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .compact()
        .init();
}

fn display_torrent_info(metainfo: &Metainfo) {
    println!("Torrent: {}", metainfo.name);
    println!("  Size: {} ({} pieces of {})",
        format_bytes(metainfo.total_size),
        metainfo.num_pieces(),
        format_bytes(metainfo.piece_length as u64),
    );
    println!("  Files: {}", metainfo.files.len());
    println!("  Info hash: {}", metainfo.info_hash_hex());
    println!("  Tracker: {}", metainfo.announce);
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse_args();
    init_logging(&args);
    info!("btdl starting");

    let metainfo = MetainfoParser::parse_file(&args.torrent_file)
        .context("Failed to load torrent file")?;
    let total_size = metainfo.total_size;

    if !args.quiet {
        display_torrent_info(&metainfo);
    }

    let config = args.engine_config();
    debug!("Engine config: {:?}", config);

    let mut handle = Engine::new(metainfo, config)
        .start()
        .await
        .context("Failed to start engine")?;

    let mut progress = ProgressLine::new(args.quiet);
    let mut stats_rx = handle.stats_receiver();
    let mut completed = false;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for interrupt")?;
                info!("Interrupted");
                progress.finish("Interrupted, shutting down...")?;
                break;
            }

            changed = stats_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let stats = stats_rx.borrow().clone();
                progress.update(&stats, total_size)?;
                if stats.state == TorrentState::Error {
                    let reason = stats.last_error.unwrap_or_else(|| "unknown".to_string());
                    progress.print_error(&reason)?;
                    error!("Torrent failed: {}", reason);
                    break;
                }
            }

            event = handle.next_event() => {
                match event {
                    Some(EngineEvent::Completed) => {
                        completed = true;
                        progress.finish(&format!(
                            "Download complete: {}",
                            format_bytes(total_size)
                        ))?;
                        break;
                    }
                    Some(other) => debug!("Event: {:?}", other),
                    None => break,
                }
            }
        }
    }

    handle.shutdown().await;
    info!("btdl finished");

    if completed {
        Ok(())
    } else {
        std::process::exit(130);
    }
}

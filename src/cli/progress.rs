//! Progress line rendering
//!
//! One overwritten terminal line per stats snapshot.

use std::io::{self, Write};
use std::time::Duration;

use crate::engine::EngineStats;

/// Format bytes to a human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Single-line progress display
pub struct ProgressLine {
    quiet: bool,
}

impl ProgressLine {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    /// Redraw the progress line from a stats snapshot
    pub fn update(&mut self, stats: &EngineStats, total: u64) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        let percent = stats.progress * 100.0;
        let bar_width = 30usize;
        let filled = (stats.progress * bar_width as f64) as usize;
        let bar: String = "=".repeat(filled) + &" ".repeat(bar_width.saturating_sub(filled));

        let eta = stats
            .eta
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());

        print!(
            "\r\x1b[2K[{}] {:>5.1}% | {} / {} | \u{2193} {} | \u{2191} {} | peers {}/{} | eta {}",
            bar,
            percent,
            format_bytes(stats.downloaded),
            format_bytes(total),
            format_speed(stats.download_rate),
            format_speed(stats.upload_rate),
            stats.connected_peers,
            stats.total_peers,
            eta,
        );
        if let Some(error) = &stats.last_error {
            print!(" | {}", error);
        }
        io::stdout().flush()
    }

    pub fn finish(&mut self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        println!("\r\x1b[2K{}", message);
        Ok(())
    }

    pub fn print_error(&self, message: &str) -> io::Result<()> {
        eprintln!("\r\x1b[2KError: {}", message);
        Ok(())
    }
}

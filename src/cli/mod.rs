//! Command-line interface

pub mod args;
pub mod progress;

pub use args::CliArgs;
pub use progress::ProgressLine;

// ABOUTME: CLI argument parsing and command routing for mediaworkers
//
// Provides command-line access to the tag reader workers:
// - Reading tags (read)
// - Checking files (is-media)
// - Extracting embedded covers (art)
// - Rating songs (rate)
// - Inspecting the worker pool (status)

/// Pool status command
pub mod status;
/// Per-file tag commands
pub mod tags;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// Read and write media tags through isolated worker processes
#[derive(Debug, Parser)]
#[command(name = "mediaworkers")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Command to run
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to ~/.config/mediaworkers/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Number of worker processes
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Log format on stderr
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,
}

/// Output format for commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tables and lines
    #[default]
    Text,
    /// Pretty-printed JSON
    Json,
}

/// Available CLI commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the tags of one or more files
    Read(FilesArgs),

    /// Check whether files are readable media files
    IsMedia(FilesArgs),

    /// Extract the embedded cover of a file
    Art(ArtArgs),

    /// Set the rating of a file
    Rate(RateArgs),

    /// Show worker pool status
    Status(StatusArgs),
}

/// Arguments naming one or more files
#[derive(Debug, clap::Args)]
pub struct FilesArgs {
    /// Media files
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

/// Arguments for the art command
#[derive(Debug, clap::Args)]
pub struct ArtArgs {
    /// Media file
    pub file: PathBuf,

    /// Write the cover to this path instead of reporting its size
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Arguments for the rate command
#[derive(Debug, clap::Args)]
pub struct RateArgs {
    /// Media file
    pub file: PathBuf,

    /// Rating between 0.0 and 1.0
    #[arg(value_parser = parse_rating)]
    pub rating: f32,
}

/// Arguments for the status command
#[derive(Debug, clap::Args)]
pub struct StatusArgs {
    /// Seconds to wait for workers to connect before reporting
    #[arg(long, default_value_t = 2)]
    pub wait: u64,
}

fn parse_rating(value: &str) -> Result<f32, String> {
    let rating: f32 = value.parse().map_err(|e| format!("invalid rating {value:?}: {e}"))?;
    if (0.0..=1.0).contains(&rating) {
        Ok(rating)
    } else {
        Err(format!("rating {rating} is outside 0.0..=1.0"))
    }
}

// ABOUTME: Main entry point for the mediaworkers CLI
//
// Binary: mediaworkers
// Usage: mediaworkers [OPTIONS] <COMMAND>
// - read: print tags of media files
// - is-media: check whether files are media files
// - art: extract an embedded cover
// - rate: store a song rating
// - status: show worker pool status

//! Command-line front end for the tag reader workers

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;

use mediaworkers::cli::{self, Cli, Commands, OutputFormat};
use mediaworkers::config::AppConfig;
use mediaworkers::logging::{setup_logging, setup_panic_handler};
use mediaworkers::tagreader::TagReaderClient;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    setup_logging(args.log_format, "mediaworkers");
    setup_panic_handler();

    let config = AppConfig::load(args.config.as_deref())?;
    let pool_config = config.tagreader_pool(args.workers);
    debug!(
        executable = %pool_config.executable,
        workers = pool_config.worker_count,
        "Starting tag reader pool"
    );

    let client = TagReaderClient::with_pool_config(pool_config).context("Failed to start tag reader workers")?;
    let result = run_command(&client, args.command, args.format).await;

    // Joining the pool thread blocks; keep it off the async workers.
    tokio::task::spawn_blocking(move || client.shutdown())
        .await
        .context("Pool shutdown panicked")?;

    result
}

async fn run_command(client: &TagReaderClient, command: Commands, format: OutputFormat) -> Result<()> {
    match command {
        Commands::Read(args) => cli::tags::read(client, args, format).await,
        Commands::IsMedia(args) => cli::tags::is_media(client, args, format).await,
        Commands::Art(args) => cli::tags::art(client, args, format).await,
        Commands::Rate(args) => cli::tags::rate(client, args, format).await,
        Commands::Status(args) => cli::status::execute(client, args, format).await,
    }
}

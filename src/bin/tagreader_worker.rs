// ABOUTME: Tag reader worker process spawned by the pool
// ABOUTME: Connects to the endpoint given as the first argument and serves tag requests

//! Tag reader worker process

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use mediaworkers::logging::{setup_logging, setup_panic_handler, LogFormat};
use mediaworkers::tagreader::SidecarTagService;
use mediaworkers::worker_pool::serve;

/// Tag reader worker. Started by mediaworkers; not meant to be run by hand.
#[derive(Debug, Parser)]
#[command(name = "mediaworkers-tagreader", version)]
struct Args {
    /// Pool endpoint to connect to
    endpoint: PathBuf,

    /// Log format on stderr
    #[arg(long, default_value = "text")]
    log_format: LogFormat,
}

fn main() -> ExitCode {
    let args = Args::parse();
    setup_logging(args.log_format, "mediaworkers-tagreader");
    setup_panic_handler();

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    let service = SidecarTagService::new();
    match runtime.block_on(serve(&args.endpoint, &service)) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Tag reader worker stopped");
            ExitCode::FAILURE
        }
    }
}

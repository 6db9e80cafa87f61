// ABOUTME: Minimal worker that echoes request payloads back
// ABOUTME: Control payloads make it hang, crash or exit so pool recovery can be exercised

//! Echo worker used to exercise the pool in tests

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, warn};

use mediaworkers::logging::{setup_logging, LogFormat};
use mediaworkers::worker_pool::{serve, WorkerService};

/// Echo worker used by the integration tests
#[derive(Debug, Parser)]
#[command(name = "echo-worker")]
struct Args {
    /// Pool endpoint to connect to
    endpoint: PathBuf,
}

/// Payloads:
/// - `!hang` is never answered
/// - `!crash` aborts the process
/// - `!exit` exits cleanly without answering
/// - `!pid` answers with the worker's process id
/// - `!tag <text>` answers `<pid> <text>`
/// - `!sleep <ms>` answers `slept` after the delay
/// - anything else is echoed
struct EchoService;

impl WorkerService for EchoService {
    fn handle(&self, payload: &[u8]) -> Option<Vec<u8>> {
        match payload {
            b"!hang" => None,
            b"!crash" => {
                warn!("Crash requested");
                std::process::abort();
            }
            b"!exit" => std::process::exit(0),
            b"!pid" => Some(std::process::id().to_string().into_bytes()),
            _ => {
                if let Some(text) = payload.strip_prefix(b"!tag ") {
                    let mut response = format!("{} ", std::process::id()).into_bytes();
                    response.extend_from_slice(text);
                    return Some(response);
                }
                if let Some(ms) = payload.strip_prefix(b"!sleep ") {
                    let ms = std::str::from_utf8(ms).ok()?.trim().parse().ok()?;
                    std::thread::sleep(Duration::from_millis(ms));
                    return Some(b"slept".to_vec());
                }
                Some(payload.to_vec())
            }
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    setup_logging(LogFormat::Text, "echo-worker");

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(&args.endpoint, &EchoService)) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Echo worker stopped");
            ExitCode::FAILURE
        }
    }
}

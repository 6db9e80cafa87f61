// ABOUTME: Worker-process side of the channel: connect back to the pool and serve requests
// ABOUTME: Each request frame is answered with a frame carrying the same correlation id

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::net::UnixStream;
use tracing::{debug, info, trace};

use super::framing::{read_frame, write_frame, FrameDecoder, FrameError, DEFAULT_MAX_FRAME_LEN};

/// Errors that end a worker's serving loop
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Could not connect to the pool's endpoint
    #[error("Failed to connect to {path}: {source}")]
    Connect {
        /// Endpoint address from argv
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The channel broke mid-stream
    #[error("Channel error: {0}")]
    Frame(#[from] FrameError),
}

/// Request handler run inside a worker process
#[cfg_attr(test, mockall::automock)]
pub trait WorkerService: Send + Sync {
    /// Handle one request payload.
    ///
    /// `None` sends no response; the pool side keeps the request pending
    /// until the connection closes.
    fn handle(&self, payload: &[u8]) -> Option<Vec<u8>>;
}

/// Counters reported when the pool closes the connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeStats {
    /// Requests received
    pub requests: u64,
    /// Requests the service chose not to answer
    pub unanswered: u64,
}

/// Connect to `endpoint` and serve until the pool closes the connection.
pub async fn serve<S: WorkerService>(endpoint: &Path, service: &S) -> Result<ServeStats, WorkerError> {
    let stream = UnixStream::connect(endpoint)
        .await
        .map_err(|source| WorkerError::Connect {
            path: endpoint.to_path_buf(),
            source,
        })?;

    info!(endpoint = %endpoint.display(), pid = std::process::id(), "Worker connected to pool");
    serve_stream(stream, service, DEFAULT_MAX_FRAME_LEN).await
}

/// Serve requests on an already connected stream.
///
/// Requests are handled one at a time in arrival order. Returns on clean EOF.
pub async fn serve_stream<S: WorkerService>(
    mut stream: UnixStream,
    service: &S,
    max_frame_len: usize,
) -> Result<ServeStats, WorkerError> {
    let mut decoder = FrameDecoder::new(max_frame_len);
    let mut stats = ServeStats::default();

    while let Some(frame) = read_frame(&mut stream, &mut decoder).await? {
        stats.requests += 1;
        trace!(id = frame.id, bytes = frame.payload.len(), "Request received");

        match service.handle(&frame.payload) {
            Some(response) => write_frame(&mut stream, frame.id, &response, max_frame_len).await?,
            None => {
                stats.unanswered += 1;
                debug!(id = frame.id, "Request left unanswered");
            }
        }
    }

    info!(requests = stats.requests, "Pool closed the connection");
    Ok(stats)
}

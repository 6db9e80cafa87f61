// ABOUTME: Typed RPC facade over a worker pool running tag reader workers
// ABOUTME: Async calls return TagReply; blocking wrappers decode failures to safe defaults

//! Tag reader client.
//!
//! # Usage
//!
//! ```ignore
//! use mediaworkers::tagreader::{TagReaderClient, TagReaderConfig};
//!
//! let client = TagReaderClient::start(&TagReaderConfig::default(), &PoolConfig::default())?;
//!
//! // From a plain thread
//! if let Some(song) = client.read_file_blocking("/music/song.flac") {
//!     println!("{}", song.title);
//! }
//!
//! // From async code
//! let response = client.is_media_file("/music/song.flac").wait().await?;
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use super::protocol::{Song, SongMetadata, TagRequest, TagResponse};
use crate::worker_pool::config::{capped_worker_count, default_worker_count};
use crate::worker_pool::{
    MetricsSnapshot, PoolConfig, PoolEvent, Reply, ReplyError, SlotStatus, WorkerPool, WorkerPoolBuilder,
};

/// Default name of the tag reader worker executable
pub const DEFAULT_EXECUTABLE: &str = "mediaworkers-tagreader";

/// Errors surfaced by the tag reader client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The worker pool could not be started
    #[error("Failed to start tag reader pool: {0}")]
    Start(String),

    /// The request did not get a response
    #[error(transparent)]
    Reply(#[from] ReplyError),

    /// The request could not be serialized
    #[error("Failed to encode request: {0}")]
    Encode(String),

    /// The response could not be deserialized
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// The worker rejected the request
    #[error("Worker reported an error: {0}")]
    Worker(String),

    /// The worker answered with the wrong response type
    #[error("Expected {expected} response, got {actual}")]
    UnexpectedResponse {
        /// Response kind matching the request
        expected: &'static str,
        /// Response kind received
        actual: &'static str,
    },
}

/// `[tagreader]` configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagReaderConfig {
    /// Worker executable name or path
    pub executable: String,

    /// Worker count; defaults to `clamp(cpus / 2, 1, 2)`, capped at the CPU count
    pub worker_count: Option<usize>,
}

impl Default for TagReaderConfig {
    fn default() -> Self {
        Self {
            executable: DEFAULT_EXECUTABLE.to_string(),
            worker_count: None,
        }
    }
}

impl TagReaderConfig {
    /// Pool settings for tag reader workers, taking everything else from `base`
    #[must_use]
    pub fn pool_config(&self, base: &PoolConfig) -> PoolConfig {
        PoolConfig {
            executable: self.executable.clone(),
            worker_count: self
                .worker_count
                .map_or_else(default_worker_count, capped_worker_count),
            ..base.clone()
        }
    }
}

/// Outstanding tag reader request
#[derive(Debug, Clone)]
pub struct TagReply {
    reply: Reply,
    expected: &'static str,
}

impl TagReply {
    /// Correlation id, once dispatched to a worker
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        self.reply.id()
    }

    /// Whether the response (or a failure) has arrived
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.reply.is_finished()
    }

    /// Underlying untyped reply
    #[must_use]
    pub fn raw(&self) -> &Reply {
        &self.reply
    }

    /// Wait asynchronously for the decoded response.
    pub async fn wait(&self) -> Result<TagResponse, ClientError> {
        self.decode(self.reply.wait().await)
    }

    /// Block until the decoded response arrives. Not for use on the pool thread.
    pub fn wait_blocking(&self) -> Result<TagResponse, ClientError> {
        self.decode(self.reply.wait_blocking())
    }

    fn decode(&self, outcome: Result<Vec<u8>, ReplyError>) -> Result<TagResponse, ClientError> {
        let bytes = outcome?;
        let response: TagResponse =
            serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))?;

        match response {
            TagResponse::Error { message } => Err(ClientError::Worker(message)),
            response if response.kind() == self.expected => Ok(response),
            response => Err(ClientError::UnexpectedResponse {
                expected: self.expected,
                actual: response.kind(),
            }),
        }
    }
}

/// Typed client for tag reader workers.
///
/// Owns its pool; dropping the client shuts the workers down.
#[derive(Debug)]
pub struct TagReaderClient {
    pool: WorkerPool,
    degraded: Arc<AtomicBool>,
}

impl TagReaderClient {
    /// Start a pool of tag reader workers.
    pub fn start(config: &TagReaderConfig, base: &PoolConfig) -> Result<Self, ClientError> {
        Self::with_pool_config(config.pool_config(base))
    }

    /// Start with a fully specified pool configuration.
    pub fn with_pool_config(pool_config: PoolConfig) -> Result<Self, ClientError> {
        let builder = WorkerPoolBuilder::new(pool_config);
        let events = builder.subscribe();
        let pool = builder.start().map_err(|e| ClientError::Start(e.to_string()))?;

        let degraded = Arc::new(AtomicBool::new(false));
        pool.runtime().spawn(watch_events(events, Arc::clone(&degraded)));

        Ok(Self { pool, degraded })
    }

    /// True once a worker could not be started; requests then fail fast
    /// if no other worker is running.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Underlying pool
    #[must_use]
    pub const fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Snapshot of every worker slot
    pub async fn slot_statuses(&self) -> Vec<SlotStatus> {
        self.pool.slot_statuses().await
    }

    /// Pool counters
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.pool.metrics()
    }

    /// Stop the workers. Later requests fail with `PoolShutDown`.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    // === Async API ===
    //
    // Each call sends immediately and returns a handle to await or poll.

    /// Read the tags and file properties of `filename`.
    ///
    /// Resolves to [`TagResponse::ReadFile`] with `metadata: None` when the
    /// worker could not read the file.
    pub fn read_file(&self, filename: impl AsRef<Path>) -> TagReply {
        self.request(&TagRequest::ReadFile {
            filename: filename.as_ref().to_path_buf(),
        })
    }

    /// Replace the tags of `filename` with `metadata`.
    ///
    /// The worker touches the file afterwards so library scanners notice it.
    pub fn save_file(&self, filename: impl AsRef<Path>, metadata: &SongMetadata) -> TagReply {
        self.request(&TagRequest::SaveFile {
            filename: filename.as_ref().to_path_buf(),
            metadata: metadata.clone(),
        })
    }

    /// Ask whether `filename` is a media file that can carry tags
    pub fn is_media_file(&self, filename: impl AsRef<Path>) -> TagReply {
        self.request(&TagRequest::IsMediaFile {
            filename: filename.as_ref().to_path_buf(),
        })
    }

    /// Fetch the cover stored inside `filename`; empty data when there is none
    pub fn load_embedded_art(&self, filename: impl AsRef<Path>) -> TagReply {
        self.request(&TagRequest::LoadEmbeddedArt {
            filename: filename.as_ref().to_path_buf(),
        })
    }

    /// Write `song`'s play statistics into its file
    pub fn update_song_statistics(&self, song: &Song) -> TagReply {
        self.request(&TagRequest::statistics_for(song))
    }

    /// Write `song`'s rating into its file
    pub fn update_song_rating(&self, song: &Song) -> TagReply {
        self.request(&TagRequest::rating_for(song))
    }

    // === Blocking API ===

    /// Metadata of `filename`, or `None` if it cannot be read
    pub fn read_file_blocking(&self, filename: impl AsRef<Path>) -> Option<SongMetadata> {
        let filename = filename.as_ref();
        match self.read_file(filename).wait_blocking() {
            Ok(TagResponse::ReadFile { metadata }) => metadata,
            Ok(_) => None,
            Err(e) => {
                warn!(file = %filename.display(), error = %e, "read_file failed");
                None
            }
        }
    }

    /// Whether the tags were written
    pub fn save_file_blocking(&self, filename: impl AsRef<Path>, metadata: &SongMetadata) -> bool {
        let filename = filename.as_ref();
        match self.save_file(filename, metadata).wait_blocking() {
            Ok(TagResponse::SaveFile { success }) => success,
            Ok(_) => false,
            Err(e) => {
                warn!(file = %filename.display(), error = %e, "save_file failed");
                false
            }
        }
    }

    /// Whether `filename` is a readable media file
    pub fn is_media_file_blocking(&self, filename: impl AsRef<Path>) -> bool {
        let filename = filename.as_ref();
        match self.is_media_file(filename).wait_blocking() {
            Ok(TagResponse::IsMediaFile { success }) => success,
            Ok(_) => false,
            Err(e) => {
                warn!(file = %filename.display(), error = %e, "is_media_file failed");
                false
            }
        }
    }

    /// Embedded cover bytes; empty if there are none or the request failed
    pub fn load_embedded_art_blocking(&self, filename: impl AsRef<Path>) -> Vec<u8> {
        let filename = filename.as_ref();
        match self.load_embedded_art(filename).wait_blocking() {
            Ok(TagResponse::LoadEmbeddedArt { data }) => data,
            Ok(_) => vec![],
            Err(e) => {
                warn!(file = %filename.display(), error = %e, "load_embedded_art failed");
                vec![]
            }
        }
    }

    // === Batch API ===

    /// Send one statistics update per song without waiting. Failures are logged.
    pub fn update_songs_statistics(&self, songs: &[Song]) {
        for song in songs {
            self.spawn_logged(self.update_song_statistics(song), song);
        }
    }

    /// Send one rating update per song without waiting. Failures are logged.
    pub fn update_songs_rating(&self, songs: &[Song]) {
        for song in songs {
            self.spawn_logged(self.update_song_rating(song), song);
        }
    }

    fn spawn_logged(&self, reply: TagReply, song: &Song) {
        let filename = song.filename.clone();
        self.pool.runtime().spawn(async move {
            match reply.wait().await {
                Ok(TagResponse::UpdateSongStatistics { success: true } | TagResponse::UpdateSongRating { success: true }) => {
                    debug!(file = %filename.display(), "Song update stored");
                }
                Ok(response) => {
                    warn!(file = %filename.display(), response = response.kind(), "Worker did not store song update");
                }
                Err(e) => {
                    warn!(file = %filename.display(), error = %e, "Song update failed");
                }
            }
        });
    }

    fn request(&self, request: &TagRequest) -> TagReply {
        let expected = expected_kind(request);
        let reply = match serde_json::to_vec(request) {
            Ok(payload) => self.pool.send(payload),
            Err(e) => {
                error!(file = %request.filename().display(), error = %e, "Failed to encode request");
                Reply::failed(ReplyError::Aborted)
            }
        };
        TagReply { reply, expected }
    }
}

const fn expected_kind(request: &TagRequest) -> &'static str {
    match request {
        TagRequest::ReadFile { .. } => "read_file",
        TagRequest::SaveFile { .. } => "save_file",
        TagRequest::IsMediaFile { .. } => "is_media_file",
        TagRequest::LoadEmbeddedArt { .. } => "load_embedded_art",
        TagRequest::UpdateSongStatistics { .. } => "update_song_statistics",
        TagRequest::UpdateSongRating { .. } => "update_song_rating",
    }
}

async fn watch_events(mut events: broadcast::Receiver<PoolEvent>, degraded: Arc<AtomicBool>) {
    loop {
        match events.recv().await {
            Ok(PoolEvent::FailedToStart { slot, error }) => {
                error!(slot, error = %error, "Tag reader worker failed to start; tag reading is degraded");
                degraded.store(true, Ordering::Relaxed);
            }
            Ok(event) => debug!(event = ?event, "Tag reader pool event"),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(missed, "Missed tag reader pool events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ABOUTME: Tag reading and writing offloaded to mediaworkers-tagreader worker processes
//
// - protocol: JSON request/response schema
// - client: typed facade over a WorkerPool (async, blocking, and batch calls)
// - service: filesystem-backed worker implementation

pub mod client;
/// JSON messages exchanged with workers
pub mod protocol;
pub mod service;

pub use client::{ClientError, TagReaderClient, TagReaderConfig, TagReply};
pub use protocol::{FileType, Song, SongMetadata, TagRequest, TagResponse};
pub use service::SidecarTagService;

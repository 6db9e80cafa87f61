// ABOUTME: Out-of-process worker pool with framed, correlated request/response channels
//
// Runs N helper processes that connect back over private Unix sockets, so
// crash-prone or blocking work never runs inside the calling process.
//
// Key components:
// - framing: [u32 length][u64 correlation id][payload] wire codec
// - reply: single-fulfillment reply shared between caller and pool thread
// - handler: per-worker channel matching responses to pending requests
// - process_supervisor: spawn, exit watching, termination, restart backoff
// - endpoint: private listening sockets the workers connect to
// - pool: pool thread actor, round-robin dispatch, request queue
// - worker: serving loop used inside worker processes

/// Pool settings
pub mod config;
/// Private sockets workers connect back to
pub mod endpoint;
pub mod framing;
pub mod handler;
/// Pool counters
pub mod metrics;
pub mod pool;
/// Worker process lifecycle
pub mod process_supervisor;
pub mod reply;
/// Serving loop for worker processes
pub mod worker;

// Re-exports for convenient access
pub use config::PoolConfig;
pub use handler::Handler;
pub use metrics::MetricsSnapshot;
pub use pool::{
    DeathCause, PoolError, PoolEvent, PoolResult, SlotState, SlotStatus, WorkerPool, WorkerPoolBuilder,
};
pub use reply::{Reply, ReplyError, ReplyOutcome};
pub use worker::{serve, ServeStats, WorkerError, WorkerService};

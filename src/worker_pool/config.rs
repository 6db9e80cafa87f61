// ABOUTME: Configuration for the worker pool
//
// Defines PoolConfig with all tunable parameters for the pool:
// - Worker executable, count, and environment
// - Endpoint naming
// - Dispatch timeout for requests waiting on a connected worker
// - Restart backoff and shutdown grace period
// - Frame size limit

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::framing::DEFAULT_MAX_FRAME_LEN;

/// Endpoint prefix used when the application name cannot be determined
pub const FALLBACK_ENDPOINT_PREFIX: &str = "workerpool";

/// Configuration for a worker pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Worker executable name or path
    pub executable: String,

    /// Number of worker processes
    pub worker_count: usize,

    /// Prefix for listening endpoint names (`<prefix>_<random>.sock`)
    pub endpoint_prefix: String,

    /// Extra directories searched for the executable after the application directory
    pub search_dirs: Vec<PathBuf>,

    /// Extra environment variables for worker processes
    pub worker_env: HashMap<String, String>,

    // === Timeouts ===
    /// How long a request may wait for any worker to be connected
    #[serde(with = "duration_millis")]
    pub dispatch_timeout: Duration,

    /// Initial respawn delay (exponential backoff base)
    #[serde(with = "duration_millis")]
    pub restart_backoff_base: Duration,

    /// Maximum respawn delay (exponential backoff cap)
    #[serde(with = "duration_millis")]
    pub restart_backoff_max: Duration,

    /// Time a worker gets to exit on its own at each shutdown step
    #[serde(with = "duration_millis")]
    pub shutdown_grace: Duration,

    // === Wire ===
    /// Largest accepted frame (correlation id header plus payload)
    pub max_frame_len: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            executable: String::new(),
            worker_count: default_worker_count(),
            endpoint_prefix: default_endpoint_prefix(),
            search_dirs: vec![],
            worker_env: HashMap::new(),

            dispatch_timeout: Duration::from_secs(30),
            restart_backoff_base: Duration::from_millis(100),
            restart_backoff_max: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(500),

            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl PoolConfig {
    /// Default configuration for `executable`
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }

    /// Check the settings a pool cannot start without
    pub fn validate(&self) -> Result<(), String> {
        if self.executable.trim().is_empty() {
            return Err("worker executable is not set".to_string());
        }
        if self.worker_count == 0 {
            return Err("worker_count must be at least 1".to_string());
        }
        if self.endpoint_prefix.is_empty() || self.endpoint_prefix.contains('/') {
            return Err(format!(
                "endpoint_prefix {:?} must be non-empty and contain no '/'",
                self.endpoint_prefix
            ));
        }
        if self.max_frame_len < super::framing::ID_HEADER_LEN {
            return Err("max_frame_len is smaller than the frame header".to_string());
        }
        Ok(())
    }
}

/// Number of CPUs available to this process (at least 1)
pub fn available_cpus() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// `clamp(cpus / 2, 1, 2)`: enough to hide one crash without hogging cores
pub fn default_worker_count() -> usize {
    (available_cpus() / 2).clamp(1, 2)
}

/// Clamp a requested worker count to `[1, available CPUs]`
pub fn capped_worker_count(requested: usize) -> usize {
    requested.clamp(1, available_cpus())
}

/// Lower-cased name of the running executable, or the fallback prefix
pub fn default_endpoint_prefix() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|s| s.to_string_lossy().to_lowercase()))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_ENDPOINT_PREFIX.to_string())
}

/// Serde helper for Duration as milliseconds (u64)
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// ABOUTME: Private listening endpoints that worker processes connect back to
// ABOUTME: Sockets live in a per-pool 0700 temp dir and are named <prefix>_<random u32>.sock

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};
use uuid::Uuid;

/// Attempts at finding an unused socket name before giving up
const MAX_BIND_ATTEMPTS: usize = 16;

/// Errors creating or binding endpoints
#[derive(Debug, Error)]
pub enum EndpointError {
    /// Could not create the private socket directory
    #[error("Failed to create endpoint directory: {0}")]
    CreateDir(#[source] io::Error),

    /// Bind failed for a reason other than a name collision
    #[error("Failed to bind {path}: {source}")]
    Bind {
        /// Socket path that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Every candidate name was taken
    #[error("No free endpoint name after {0} attempts")]
    NamesExhausted(usize),
}

/// Directory owning every endpoint of one pool; removed on drop.
#[derive(Debug)]
pub struct EndpointDir {
    dir: TempDir,
    prefix: String,
}

impl EndpointDir {
    /// Create a fresh private directory for endpoints named after `prefix`.
    pub fn new(prefix: &str) -> Result<Self, EndpointError> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{prefix}-"))
            .tempdir()
            .map_err(EndpointError::CreateDir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            std::fs::set_permissions(dir.path(), perms).map_err(EndpointError::CreateDir)?;
        }

        debug!(dir = %dir.path().display(), "Created endpoint directory");

        Ok(Self {
            dir,
            prefix: prefix.to_string(),
        })
    }

    /// Directory holding the sockets
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Bind a new listening socket, retrying with a fresh suffix on collision.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(&self) -> Result<ListeningEndpoint, EndpointError> {
        self.bind_with(random_suffix)
    }

    /// Like [`EndpointDir::bind`], drawing name suffixes from `next_suffix`.
    pub fn bind_with<F>(&self, mut next_suffix: F) -> Result<ListeningEndpoint, EndpointError>
    where
        F: FnMut() -> u32,
    {
        for _ in 0..MAX_BIND_ATTEMPTS {
            let path = self.socket_path(next_suffix());

            match UnixListener::bind(&path) {
                Ok(listener) => return Ok(ListeningEndpoint { path, listener }),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    debug!(path = %path.display(), "Endpoint name taken, retrying");
                }
                Err(source) => return Err(EndpointError::Bind { path, source }),
            }
        }
        Err(EndpointError::NamesExhausted(MAX_BIND_ATTEMPTS))
    }

    fn socket_path(&self, suffix: u32) -> PathBuf {
        self.dir.path().join(format!("{}_{suffix}.sock", self.prefix))
    }
}

/// A bound socket waiting for its single worker connection.
///
/// The socket file is removed when the endpoint is dropped.
#[derive(Debug)]
pub struct ListeningEndpoint {
    path: PathBuf,
    listener: UnixListener,
}

impl ListeningEndpoint {
    /// Address handed to the worker as argv[1]
    #[must_use]
    pub fn address(&self) -> &Path {
        &self.path
    }

    /// Accept exactly one connection, then stop listening.
    pub async fn accept_one(self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }
}

impl Drop for ListeningEndpoint {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove endpoint socket");
            }
        }
    }
}

fn random_suffix() -> u32 {
    let bytes = Uuid::new_v4().into_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

//! Error types shared across subsystems.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures inside the locked store.  These never escape the store; they are
/// only logged and turned into defaults or a `false` result.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("timed out after {timeout:?} waiting for lock {path}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed document {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// An operational failure of the update engine.  The `Display` text is what
/// the operator sees in chat.
#[derive(Error, Debug)]
pub enum UpdateFailure {
    #[error("could not read container info: {0}")]
    Inspect(String),

    #[error("image pull failed: {0}")]
    Pull(String),

    #[error("could not read container configuration: {0}")]
    Config(String),

    #[error("failed to stop old container: {0}")]
    Stop(String),

    #[error("failed to remove old container: {0}")]
    Remove(String),

    #[error("failed to start new container (old container is already removed): {0}")]
    Create(String),

    #[error("new container is not running, check its logs")]
    NotRunning,

    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// A failed chat API call.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),
}

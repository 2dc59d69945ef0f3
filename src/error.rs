//! # Error Taxonomy
//!
//! Every fallible operation in the sync core returns [`SyncError`]. The
//! variants split along how the caller has to react:
//!
//! - [`SyncError::Io`] - local filesystem failure, aborts the current pass only
//! - [`SyncError::Transfer`] - one file could not be moved, recorded and skipped
//! - [`SyncError::Protocol`] - malformed or truncated wire data, tears down the connection
//! - [`SyncError::Connection`] - socket-level failure, tears down the connection
//!
//! The binary wraps these in `anyhow` at the CLI boundary.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Malformed or truncated data on the wire.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("stream ended in the middle of a {0}")]
    Truncated(&'static str),

    #[error("unknown command tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: u64, max: u64 },

    #[error("malformed {command} frame: {reason}")]
    Malformed {
        command: &'static str,
        reason: String,
    },

    #[error("invalid relative path {0:?}")]
    InvalidPath(String),

    #[error("expected {expected}, received {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },
}

/// A single file could not be moved. The connection stays usable.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{path} vanished before it could be sent")]
    SourceVanished { path: String },

    #[error("{path}: declared {expected} bytes but {actual} arrived")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("{path} not found on peer")]
    NotFound { path: String },

    #[error("peer rejected {path}: {message}")]
    Rejected { path: String, message: String },

    #[error("peer failed to handle {command}: {message}")]
    PeerFailed {
        command: &'static str,
        message: String,
    },
}

/// Socket-level failures.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed by peer")]
    Closed,

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("gave up connecting to {addr} after {attempts} attempts")]
    RetriesExhausted { addr: String, attempts: u32 },

    #[error("transfer aborted: {0}")]
    Aborted(String),

    #[error("socket error: {0}")]
    Socket(#[from] io::Error),
}

impl SyncError {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        SyncError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether the connection must be torn down after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Protocol(_) | SyncError::Connection(_))
    }
}

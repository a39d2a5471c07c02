use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the relay
pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay operation errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailure { addr: SocketAddr, reason: String },

    #[error("Connection closed")]
    EndOfStream,

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Not a regular file: {}", .0.display())]
    NotAFile(PathBuf),

    #[error("Permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("Failed to deliver to {0}")]
    SendFailure(String),

    #[error("No session named '{0}'")]
    LookupMiss(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Map an I/O error raised while touching `path` onto the file taxonomy
    pub fn from_file_io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => RelayError::FileNotFound(path.into()),
            io::ErrorKind::PermissionDenied => RelayError::PermissionDenied(path.into()),
            _ => RelayError::Io(err),
        }
    }
}

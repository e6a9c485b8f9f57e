//! Error types for the image server.
//!
//! Everything here is session-local: a `SessionError` ends one connection
//! and is logged by the server, it never stops the accept loop.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::ReplyCode;

/// Framing failures for either protocol variant.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("incomplete header: received {received} of {expected} bytes")]
    FrameIncomplete { received: usize, expected: usize },

    #[error("invalid file size field {0:?}")]
    InvalidSize(String),

    #[error("no size line received within {0:?}")]
    LineStalled(Duration),

    #[error("connection closed before size line terminator")]
    LineClosed,

    #[error("size line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("header carries no filename")]
    MissingFilename,

    #[error("socket error while reading header: {0}")]
    Io(#[from] io::Error),
}

/// Why a transfer session ended without a complete image.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{} already exists but overwrite flag is not set", path.display())]
    FilesystemConflict { path: PathBuf },

    #[error("folder {} does not exist", dir.display())]
    DestinationMissing { dir: PathBuf },

    #[error("received {received} of {expected} bytes for {}", path.display())]
    TransferIncomplete {
        path: PathBuf,
        received: u64,
        expected: u64,
    },

    #[error("socket error: {0}")]
    Transport(#[source] io::Error),

    #[error("filesystem error on {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SessionError {
    pub(crate) fn filesystem(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Reply owed to a full-mode client for this error, if any.
    ///
    /// Header failures and socket errors get no reply: the peer either never
    /// sent a usable request or can no longer be written to.
    pub fn reply_code(&self) -> Option<ReplyCode> {
        match self {
            SessionError::Protocol(ProtocolError::MissingFilename) => Some(ReplyCode::TransferError),
            SessionError::Protocol(_) => None,
            SessionError::FilesystemConflict { .. } => Some(ReplyCode::TransferError),
            SessionError::DestinationMissing { .. } => Some(ReplyCode::DirectoryMissing),
            SessionError::TransferIncomplete { .. } => Some(ReplyCode::TransferError),
            SessionError::Transport(_) => None,
            SessionError::Filesystem { .. } => Some(ReplyCode::TransferError),
        }
    }
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;

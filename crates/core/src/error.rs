//! Error kinds shared by the engine, the replica and the transports

use std::path::PathBuf;

use thiserror::Error;

use crate::client::ClientId;
use crate::file::FileId;

/// Messages that refer to state the receiver does not have.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateInconsistency {
    /// No client with this id (never introduced, or evicted)
    #[error("unknown client {0}")]
    UnknownClient(ClientId),
    /// No tracked file with this id
    #[error("unknown file {0}")]
    UnknownFile(FileId),
    /// The file is known but has no region at this offset
    #[error("file {file_id} has no region at offset {offset}")]
    RegionMismatch {
        /// File the region was reported for
        file_id: FileId,
        /// Offset that did not match any region
        offset: u64,
    },
}

/// Errors surfaced by sync operations.
///
/// None of these are fatal: loops log them and move on to the next item.
#[derive(Debug, Error)]
pub enum SyncError {
    /// File missing, permission denied, truncated read
    #[error("I/O failure on {}: {source}", path.display())]
    Io {
        /// Path the operation was performed on
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Network or RPC failure
    #[error("transport failure: {0}")]
    Transport(String),

    /// A message referred to state that does not exist
    #[error("state inconsistency: {0}")]
    State(#[from] StateInconsistency),
}

impl SyncError {
    /// Wrap an I/O error together with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Build a transport failure from anything printable
    pub fn transport(message: impl std::fmt::Display) -> Self {
        Self::Transport(message.to_string())
    }

    /// True if this is an I/O failure caused by a missing file
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }

    /// The client id, if this error says the client is unknown
    #[must_use]
    pub fn unknown_client(&self) -> Option<ClientId> {
        match self {
            Self::State(StateInconsistency::UnknownClient(id)) => Some(*id),
            _ => None,
        }
    }
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display_names_path() {
        let err = SyncError::io(
            "data/a.bin",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("data/a.bin"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_unknown_client_is_detected() {
        let err: SyncError = StateInconsistency::UnknownClient(42).into();
        assert_eq!(err.unknown_client(), Some(42));
        assert!(!err.is_not_found());

        let other: SyncError = StateInconsistency::UnknownFile(7).into();
        assert_eq!(other.unknown_client(), None);
    }
}

//! Error types for the sync engine.

use std::path::PathBuf;

use thiserror::Error;

use crate::remote::RemoteError;
use crate::tagstore::TagStoreError;

/// Errors that can occur while mirroring.
#[derive(Debug, Error)]
pub enum Error {
    /// Could not open or authenticate the account's connection.
    #[error("account {account}: {source}")]
    Session {
        /// Account user name.
        account: String,
        /// Underlying failure.
        source: RemoteError,
    },

    /// A command failed while reconciling one mailbox.
    #[error("mailbox {mailbox}: {source}")]
    Protocol {
        /// Mailbox name.
        mailbox: String,
        /// Underlying failure.
        source: RemoteError,
    },

    /// Local index or archive I/O failed.
    #[error("storage error at {}: {source}", path.display())]
    Storage {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The tag store rejected a query or batch.
    #[error("tag store: {0}")]
    TagStore(#[from] TagStoreError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Wraps an I/O error with the path it concerns.
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Storage failures stop the whole run; everything else is scoped to
    /// an account or mailbox.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }

    /// True when the account's connection can no longer be used.
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::Session { .. } => true,
            Self::Protocol { source, .. } => source.is_connection_lost(),
            _ => false,
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

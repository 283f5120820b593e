//! Unified error types for the harbord workspace.
//!
//! Every fallible operation in the lifecycle core returns [`HarbordError`].
//! Variants are grouped into the five caller-facing categories of
//! [`ErrorKind`] so the API layer can map them onto status codes without
//! matching on individual variants.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum HarbordError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A referenced object does not exist.
    #[error("no such {kind}: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier, name or prefix that failed to resolve.
        id: String,
    },

    /// The operation is invalid in the object's current lifecycle phase.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflicting state.
        message: String,
    },

    /// A container name is already held by another container.
    #[error("conflict: the container name \"{name}\" is already in use by container \"{holder}\"")]
    NameConflict {
        /// The requested name.
        name: String,
        /// ID of the container currently holding the name.
        holder: String,
    },

    /// The request itself is malformed.
    #[error("invalid parameter: {message}")]
    InvalidParameter {
        /// Description of the invalid value.
        message: String,
    },

    /// An ID prefix matched more than one object.
    #[error("multiple IDs found with provided prefix: {prefix} ({matches} matches)")]
    Ambiguous {
        /// The prefix that was looked up.
        prefix: String,
        /// Number of matching IDs.
        matches: usize,
    },

    /// An unexpected failure in the runtime or host system.
    #[error("system error: {message}")]
    System {
        /// Description of the failure.
        message: String,
    },

    /// A persisted document could not be decoded.
    #[error("failed to decode {path}: {source}")]
    Corrupt {
        /// File that failed to decode.
        path: PathBuf,
        /// Underlying decode error.
        source: serde_json::Error,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

/// Caller-facing error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The reference does not resolve.
    NotFound,
    /// The operation conflicts with the current lifecycle phase.
    Conflict,
    /// The request was rejected before any mutation.
    InvalidParameter,
    /// Internal failure; details are only logged server-side.
    System,
    /// An ID prefix matched more than one object.
    Ambiguous,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Conflict => write!(f, "conflict"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::System => write!(f, "system"),
            Self::Ambiguous => write!(f, "ambiguous"),
        }
    }
}

impl HarbordError {
    /// Builds an I/O error for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds a container `NotFound` error.
    pub fn no_such_container(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "container",
            id: id.into(),
        }
    }

    /// Builds a `Conflict` error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Builds an `InvalidParameter` error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Builds a `System` error.
    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    /// Returns the caller-facing category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } | Self::NameConflict { .. } => ErrorKind::Conflict,
            Self::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            Self::Ambiguous { .. } => ErrorKind::Ambiguous,
            Self::Io { .. }
            | Self::System { .. }
            | Self::Corrupt { .. }
            | Self::Serialization { .. } => ErrorKind::System,
        }
    }

    /// Returns `true` if this is a `NotFound` error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound)
    }

    /// Returns the message that may be shown to an API caller.
    ///
    /// Client-correctable errors are returned verbatim. System errors are
    /// replaced by a stable text that only names the object, since their
    /// details (paths, runtime messages) belong in the server log.
    #[must_use]
    pub fn redacted(&self, reference: &str) -> String {
        match self.kind() {
            ErrorKind::System => format!("internal error while handling container {reference}"),
            _ => self.to_string(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, HarbordError>;

//! Error types for registry and content-store operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during registry and content-store operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Failed to connect to registry.
    #[error("Failed to connect to registry at {url}: {source}")]
    ConnectionFailed {
        /// Registry URL.
        url: String,
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// Authentication failed.
    #[error("Authentication failed: {message}")]
    AuthenticationFailed {
        /// Error message.
        message: String,
    },

    /// Reference or content not found.
    #[error("{reference}: not found")]
    NotFound {
        /// Reference, digest or repository that could not be resolved.
        reference: String,
    },

    /// Content does not hash to the digest it was declared under.
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Declared digest.
        expected: String,
        /// Digest of the received bytes.
        actual: String,
    },

    /// Content length does not match the descriptor size.
    #[error("Size mismatch for {digest}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Digest of the content.
        digest: String,
        /// Declared size.
        expected: u64,
        /// Received size.
        actual: u64,
    },

    /// Malformed digest string.
    #[error("Invalid digest '{digest}': {reason}")]
    InvalidDigest {
        /// Offending digest.
        digest: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Invalid manifest content.
    #[error("Invalid manifest: {message}")]
    InvalidManifest {
        /// Error message.
        message: String,
    },

    /// File I/O error.
    #[error("File I/O error at {path}: {source}")]
    IoError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// HTTP error from registry.
    #[error("HTTP error from registry: {status} - {message}")]
    HttpError {
        /// HTTP status code.
        status: u16,
        /// Error message.
        message: String,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {source}")]
    JsonError {
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// Invalid URL.
    #[error("Invalid URL: {url}")]
    InvalidUrl {
        /// URL string.
        url: String,
    },

    /// Invalid reference format.
    #[error("Invalid reference '{reference}': {reason}")]
    InvalidReference {
        /// Reference string.
        reference: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A name was registered twice in a file store.
    #[error("Duplicate name in file store: {name}")]
    DuplicateName {
        /// Conflicting name.
        name: String,
    },

    /// Blob upload failed.
    #[error("Failed to upload blob: {message}")]
    UploadFailed {
        /// Error message.
        message: String,
    },

    /// Manifest push failed.
    #[error("Failed to push manifest to {reference}: {message}")]
    ManifestPushFailed {
        /// Destination reference.
        reference: String,
        /// Error message.
        message: String,
    },

    /// Operation deliberately unsupported by this target.
    #[error("{operation} is not implemented")]
    NotImplemented {
        /// Operation name.
        operation: String,
    },
}

impl RegistryError {
    /// Returns true if this error means the content or reference is absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for transient failures worth retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } => true,
            Self::HttpError { status, .. } => {
                matches!(*status, 0 | 408 | 429) || *status >= 500
            }
            _ => false,
        }
    }

    /// Builds an I/O error bound to a path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoError {
            path: path.into(),
            source,
        }
    }

    /// Builds a not-found error for a reference.
    pub fn not_found(reference: impl Into<String>) -> Self {
        Self::NotFound {
            reference: reference.into(),
        }
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Self::ConnectionFailed {
                url: err
                    .url()
                    .map_or_else(|| "unknown".to_string(), ToString::to_string),
                source: err,
            }
        } else if err.is_status() {
            let status = err.status().map_or(0, |s| s.as_u16());
            Self::HttpError {
                status,
                message: err.to_string(),
            }
        } else {
            Self::HttpError {
                status: 0,
                message: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError { source: err }
    }
}

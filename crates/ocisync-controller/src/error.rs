//! Error types for the controller crate.
//!
//! This module defines all errors that can occur while syncing, packing and
//! uploading artifacts.

use std::path::PathBuf;

use ocisync_registry::RegistryError;
use thiserror::Error;

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

/// Errors that can occur during sync and upload operations.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// Invalid input rejected before any network or disk activity.
    #[error("{message}")]
    Validation {
        /// What is wrong.
        message: String,
    },

    /// A time-window string could not be parsed.
    #[error("invalid duration '{input}': {reason}")]
    InvalidDuration {
        /// The offending input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A file reference resolved to an empty path.
    #[error("found empty file path in '{reference}'")]
    InvalidFileReference {
        /// The original reference string.
        reference: String,
    },

    /// A directory input holds no files at any depth.
    #[error("no files found under directory {path}")]
    EmptyDirectory {
        /// Directory that was searched.
        path: PathBuf,
    },

    /// Local I/O failure.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path involved in the operation.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Annotation file is unreadable or malformed.
    #[error("invalid annotation file {path}: {message}")]
    AnnotationFile {
        /// Annotation file path.
        path: PathBuf,
        /// What is wrong with it.
        message: String,
    },

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// A worker panicked while processing an item.
    #[error("worker panicked: {message}")]
    WorkerPanicked {
        /// Panic payload, when it was a string.
        message: String,
    },

    /// One or more tags of a repository failed.
    #[error("{} tag(s) failed: {}", .failures.len(), join_errors(.failures))]
    Tags {
        /// Per-tag failures, in processing order.
        failures: Vec<ControllerError>,
    },

    /// Failure scoped to one tag.
    #[error("tag {tag}: {source}")]
    Tag {
        /// Tag name.
        tag: String,
        /// Underlying error.
        #[source]
        source: Box<ControllerError>,
    },

    /// Failure scoped to one repository.
    #[error("repository {repository}: {source}")]
    Repository {
        /// Repository identifier (`host/path`).
        repository: String,
        /// Underlying error.
        #[source]
        source: Box<ControllerError>,
    },

    /// Registry or content-store error.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ControllerError {
    /// Builds a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Builds an I/O error bound to a path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wraps an error with the repository it belongs to.
    #[must_use]
    pub fn in_repository(self, repository: impl Into<String>) -> Self {
        Self::Repository {
            repository: repository.into(),
            source: Box::new(self),
        }
    }

    /// Wraps an error with the tag it belongs to.
    #[must_use]
    pub fn in_tag(self, tag: impl Into<String>) -> Self {
        Self::Tag {
            tag: tag.into(),
            source: Box::new(self),
        }
    }

    /// Returns the repository this error is scoped to, if any.
    #[must_use]
    pub fn repository(&self) -> Option<&str> {
        match self {
            Self::Repository { repository, .. } => Some(repository),
            _ => None,
        }
    }

    /// Returns true if this error, or the error it wraps, is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Repository { source, .. } | Self::Tag { source, .. } => source.is_cancelled(),
            Self::Tags { failures } => failures.iter().any(Self::is_cancelled),
            _ => false,
        }
    }
}

fn join_errors(errors: &[ControllerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_wrapping_display() {
        let err = ControllerError::from(RegistryError::not_found("quay.io/ns/b"))
            .in_repository("quay.io/ns/b");

        assert_eq!(err.to_string(), "repository quay.io/ns/b: quay.io/ns/b: not found");
        assert_eq!(err.repository(), Some("quay.io/ns/b"));
    }

    #[test]
    fn test_tags_display_lists_every_failure() {
        let err = ControllerError::Tags {
            failures: vec![
                ControllerError::Cancelled.in_tag("v1"),
                ControllerError::validation("bad").in_tag("v2"),
            ],
        };

        assert_eq!(
            err.to_string(),
            "2 tag(s) failed: tag v1: operation cancelled; tag v2: bad"
        );
    }

    #[test]
    fn test_invalid_duration_names_input() {
        let err = ControllerError::InvalidDuration {
            input: "4x".to_string(),
            reason: "unknown unit".to_string(),
        };
        assert!(err.to_string().contains("'4x'"));
    }

    #[test]
    fn test_is_cancelled_sees_through_wrapping() {
        let err = ControllerError::Cancelled.in_tag("v1").in_repository("quay.io/ns/a");
        assert!(err.is_cancelled());
        assert!(!ControllerError::validation("x").is_cancelled());
    }
}

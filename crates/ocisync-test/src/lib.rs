//! # ocisync Test
//!
//! Test support for the ocisync workspace.
//!
//! This crate provides:
//!
//! - [`MockRegistry`], an in-memory registry with injectable failures,
//!   artificial latency and call counters
//! - [`ArtifactBuilder`], which assembles OCI artifacts and publishes them
//!   into the mock
//!
//! ## Example
//!
//! ```rust
//! use ocisync_registry::Repository;
//! use ocisync_test::{hours_ago, ArtifactBuilder, MockRegistry};
//!
//! let registry = MockRegistry::new();
//! let repo = Repository::new("quay.io", "ns/reports");
//!
//! let artifact = ArtifactBuilder::new()
//!     .with_file("junit.xml", b"<testsuite/>")
//!     .publish(&registry, &repo, "build-42", hours_ago(2));
//!
//! assert!(registry.has_blob(&repo, &artifact.config.digest));
//! ```

pub mod fixtures;
pub mod mock_registry;

pub use fixtures::{hours_ago, Artifact, ArtifactBuilder};
pub use mock_registry::MockRegistry;

//! # ocisync Registry
//!
//! OCI registry access and local content sources for ocisync.
//!
//! This crate provides the pieces the sync controller composes:
//!
//! - **[`Registry`]**: remote capability (tags, manifests, blobs) with an
//!   HTTP implementation in [`RegistryClient`]
//! - **[`ContentStore`]**: on-disk content-addressable cache in OCI image
//!   layout
//! - **[`MemoryStore`]** and **[`FileStore`]**: in-memory and local-file
//!   content sources used when packing uploads
//! - **[`UnionTarget`]**: ordered read-only fallback across sources
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ocisync_registry::{Registry, RegistryClient, RegistryConfig, Repository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = RegistryClient::new(RegistryConfig::new())?;
//!     let repository = Repository::parse("quay.io/example/reports")?;
//!
//!     for tag in client.list_tags(&repository).await? {
//!         println!("{} {}", tag.name, tag.last_modified);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐        ┌───────────────────────────────┐
//! │  Registry (remote)   │        │  ReadOnlyTarget (local)       │
//! │  └─ RegistryClient   │        │  ├─ ContentStore  (disk)      │
//! │     (reqwest, retry) │        │  ├─ MemoryStore   (manifests) │
//! └──────────────────────┘        │  ├─ FileStore     (uploads)   │
//!                                 │  └─ UnionTarget   (fallback)  │
//!                                 └───────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod client;
mod config;
mod error;
mod file;
mod memory;
mod oci;
mod reference;
mod store;
mod target;
mod union;

pub use client::{Registry, RegistryClient};
pub use config::{RegistryAuth, RegistryConfig, RetryPolicy, TlsConfig};
pub use error::RegistryError;
pub use file::FileStore;
pub use memory::MemoryStore;
pub use oci::{
    compute_digest, digest_like, parse_digest, successors, verify_content, Annotations,
    Descriptor, Index, Manifest, MediaType, Tag, TagEntry, TagPage, ANNOTATION_CONFIG,
    ANNOTATION_CREATED, ANNOTATION_MANIFEST, ANNOTATION_REF_NAME, ANNOTATION_TITLE,
    ANNOTATION_UNPACK, EMPTY_JSON,
};
pub use reference::{is_valid_tag, parse_repo_and_tag, Reference, Repository};
pub use store::ContentStore;
pub use target::{read_all, BlobReader, ReadOnlyTarget};
pub use union::UnionTarget;

//! ocisync Controller
//!
//! Orchestration layer for syncing OCI artifacts between registries and a
//! local cache, and for re-bundling local content into new artifacts.
//!
//! # Overview
//!
//! The controller handles:
//! - **Batch Sync**: Bounded-concurrency fan-out over many repositories
//! - **Tag Windows**: Only tags modified within a time window are fetched
//! - **Caching**: Idempotent content-addressable copies into an OCI layout
//! - **Export**: Titled layers are written to a human-facing output tree
//! - **Upload**: Local files are packed into a manifest and pushed
//!
//! # Architecture
//!
//! ```text
//!   process_repositories                        upload
//!          │                                      │
//!          ▼                                      ▼
//!   ┌─────────────┐   list_tags   ┌──────────┐   ┌─────────────┐
//!   │  Scheduler  │──────────────▶│ Registry │◀──│ UnionTarget │
//!   └──────┬──────┘               └────▲─────┘   └──────┬──────┘
//!          │ process_tag               │ fetch          │ memory, files, cache
//!          ▼                           │                ▼
//!   ┌──────────────┐                   │         ┌─────────────┐
//!   │ArtifactFetch.│───────────────────┘         │ContentStore │
//!   └──────┬───────┘────────────────────────────▶└─────────────┘
//!          ▼
//!     output tree
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ocisync_controller::{SyncConfig, SyncController};
//! use ocisync_registry::{RegistryClient, RegistryConfig, Repository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::builder()
//!         .output_dir("artifacts")
//!         .window(ocisync_controller::parse_duration("2d")?)
//!         .build()?;
//!     let registry = Arc::new(RegistryClient::new(RegistryConfig::new())?);
//!     let controller = SyncController::new(config, registry)?;
//!
//!     let errors = controller
//!         .process_repositories(&[Repository::parse("quay.io/ns/app")?])
//!         .await;
//!     println!("{} repositories failed", errors.len());
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::significant_drop_tightening)]

pub mod cancel;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod packer;
pub mod scheduler;
pub mod upload;
pub mod window;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ocisync_registry::{ContentStore, Descriptor, Registry, Repository};
use tokio_util::sync::CancellationToken;

// Re-export main types at crate root
pub use cancel::cancellable;
pub use cleanup::CacheGuard;
pub use config::{default_cache_dir, SyncConfig, SyncConfigBuilder, MAX_CONCURRENCY};
pub use error::{ControllerError, Result};
pub use fetcher::{ArtifactFetcher, FetchReport};
pub use packer::{
    find_dir_with_files, load_annotation_file, load_files, pack_manifest, parse_file_reference,
    FileAnnotations, FileInput,
};
pub use scheduler::{Admission, Scheduler, SchedulerConfig, Ticket};
pub use upload::{copy_graph, UploadReport, UploadRequest};
pub use window::{filter_since, parse_duration};

/// The sync controller.
///
/// Owns the cache, the scheduler and a cancellation token shared by every
/// operation it runs. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncController {
    config: Arc<SyncConfig>,
    registry: Arc<dyn Registry>,
    store: Arc<ContentStore>,
    fetcher: ArtifactFetcher,
    scheduler: Scheduler,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SyncController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncController")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl SyncController {
    /// Creates a controller, opening (or creating) the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be created.
    pub fn new(config: SyncConfig, registry: Arc<dyn Registry>) -> Result<Self> {
        let store = Arc::new(ContentStore::open(&config.cache_dir)?);
        let fetcher = ArtifactFetcher::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            &config.output_dir,
        );
        let scheduler = Scheduler::new(config.scheduler.clone());

        tracing::debug!(
            cache = %config.cache_dir.display(),
            output = %config.output_dir.display(),
            concurrency = config.concurrency(),
            "Created sync controller"
        );

        Ok(Self {
            config: Arc::new(config),
            registry,
            store,
            fetcher,
            scheduler,
            cancel: CancellationToken::new(),
        })
    }

    /// Replaces the cancellation token, e.g. with one tied to Ctrl-C.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts every running operation when cancelled.
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the content cache.
    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Returns the scheduler.
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Processes every repository, at most `concurrency` at a time.
    ///
    /// Returns one error per failed repository, each naming the repository.
    /// A failing repository never prevents the others from being attempted.
    pub async fn process_repositories(&self, repositories: &[Repository]) -> Vec<ControllerError> {
        tracing::info!(
            repositories = repositories.len(),
            concurrency = self.config.concurrency(),
            "Processing repositories"
        );

        let controller = self.clone();
        let errors = self
            .scheduler
            .run(repositories.to_vec(), &self.cancel, move |repository| {
                let controller = controller.clone();
                async move { controller.process_repository(&repository).await }
            })
            .await;

        for error in &errors {
            tracing::warn!(
                repository = error.repository().unwrap_or("unknown"),
                error = %error,
                "Repository failed"
            );
        }
        tracing::info!(
            repositories = repositories.len(),
            failed = errors.len(),
            "Finished processing repositories"
        );
        errors
    }

    /// Lists a repository's tags, applies the time window and fetches each
    /// remaining tag in listing order.
    ///
    /// Tag failures do not stop later tags; they are collected into
    /// [`ControllerError::Tags`].
    pub async fn process_repository(&self, repository: &Repository) -> Result<()> {
        let tags = cancellable(&self.cancel, self.registry.list_tags(repository)).await?;
        let listed = tags.len();
        let tags = match self.config.window {
            Some(window) => filter_since(tags, window, Utc::now()),
            None => tags,
        };

        tracing::info!(
            repository = %repository,
            listed,
            selected = tags.len(),
            "Processing repository"
        );

        let mut failures = Vec::new();
        for tag in tags {
            match self
                .fetcher
                .process_tag(repository, &tag.name, tag.last_modified, &self.cancel)
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_cancelled() => {
                    failures.push(e.in_tag(tag.name));
                    break;
                }
                Err(e) => {
                    tracing::debug!(repository = %repository, tag = %tag.name, error = %e, "Tag failed");
                    failures.push(e.in_tag(tag.name));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ControllerError::Tags { failures })
        }
    }

    /// Fetches one tag into the cache and output tree.
    pub async fn process_tag(
        &self,
        repository: &Repository,
        tag: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<FetchReport> {
        self.fetcher
            .process_tag(repository, tag, timestamp, &self.cancel)
            .await
    }

    /// Returns a tag's manifest descriptor with the manifest's annotations.
    pub async fn fetch_annotations(&self, repository: &Repository, tag: &str) -> Result<Descriptor> {
        self.fetcher
            .fetch_annotations(repository, tag, &self.cancel)
            .await
    }

    /// Packs local files into an artifact and pushes it.
    pub async fn upload(&self, request: &UploadRequest) -> Result<UploadReport> {
        upload::upload(
            self.registry.as_ref(),
            &self.fetcher,
            Arc::clone(&self.store),
            request,
            &self.cancel,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocisync_test::{hours_ago, ArtifactBuilder, MockRegistry};
    use tempfile::TempDir;

    fn controller(dir: &TempDir, registry: Arc<MockRegistry>, window: Option<&str>) -> SyncController {
        let mut builder = SyncConfig::builder()
            .cache_dir(dir.path().join("cache"))
            .output_dir(dir.path().join("out"));
        if let Some(window) = window {
            builder = builder.window(parse_duration(window).unwrap());
        }
        SyncController::new(builder.build().unwrap(), registry).unwrap()
    }

    #[tokio::test]
    async fn test_window_selects_recent_tags() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(MockRegistry::new());
        let repo = Repository::new("quay.io", "ns/app");
        ArtifactBuilder::new()
            .with_file("old.txt", b"old")
            .publish(&registry, &repo, "old", hours_ago(72));
        ArtifactBuilder::new()
            .with_file("new.txt", b"new")
            .publish(&registry, &repo, "new", hours_ago(1));

        let controller = controller(&dir, registry, Some("2d"));
        controller.process_repository(&repo).await.unwrap();

        let names: Vec<String> = controller
            .store()
            .references()
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, ["quay.io/ns/app:new"]);
    }

    #[tokio::test]
    async fn test_tag_failures_do_not_stop_siblings() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(MockRegistry::new());
        let repo = Repository::new("quay.io", "ns/app");
        let broken = ArtifactBuilder::new()
            .with_file("bad.txt", b"bad")
            .publish(&registry, &repo, "a-broken", hours_ago(2));
        ArtifactBuilder::new()
            .with_file("good.txt", b"good")
            .publish(&registry, &repo, "b-good", hours_ago(1));
        let (bad, _) = broken.layer("bad.txt").unwrap();
        registry.fail_blob(&repo, &bad.digest);

        let controller = controller(&dir, registry, None);
        let err = controller.process_repository(&repo).await.unwrap_err();

        match err {
            ControllerError::Tags { failures } => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].to_string().starts_with("tag a-broken:"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(dir.path().join("out/quay.io/ns/app/b-good/good.txt").is_file());
    }

    #[tokio::test]
    async fn test_listed_tag_escaping_output_fails_alone() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(MockRegistry::new());
        let repo = Repository::new("quay.io", "ns/app");
        ArtifactBuilder::new()
            .with_file("a.txt", b"a")
            .publish(&registry, &repo, "../../../../escaped", hours_ago(2));
        ArtifactBuilder::new()
            .with_file("b.txt", b"b")
            .publish(&registry, &repo, "v1", hours_ago(1));

        let controller = controller(&dir, registry, None);
        let err = controller.process_repository(&repo).await.unwrap_err();

        match err {
            ControllerError::Tags { failures } => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].to_string().starts_with("tag ../../../../escaped:"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dir.path().join("escaped").exists());
        assert!(!dir.path().join("escaped.json").exists());
        assert!(dir.path().join("out/quay.io/ns/app/v1/b.txt").is_file());
    }

    #[tokio::test]
    async fn test_cancelled_controller_stops_repository() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(MockRegistry::new());
        let repo = Repository::new("quay.io", "ns/app");
        ArtifactBuilder::new()
            .with_file("a.txt", b"a")
            .publish(&registry, &repo, "v1", hours_ago(1));

        let controller = controller(&dir, registry, None);
        controller.cancellation_token().cancel();

        let err = controller.process_repository(&repo).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}

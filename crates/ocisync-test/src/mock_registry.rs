//! In-memory [`Registry`] double with failure injection and instrumentation.
//!
//! # Examples
//!
//! ```rust
//! use ocisync_test::{ArtifactBuilder, MockRegistry};
//! use ocisync_registry::Repository;
//!
//! let registry = MockRegistry::new();
//! let repo = Repository::new("quay.io", "ns/app");
//!
//! ArtifactBuilder::new()
//!     .with_file("report.xml", b"<testsuite/>")
//!     .publish(&registry, &repo, "v1", chrono::Utc::now());
//!
//! registry.fail_list_tags(&repo);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ocisync_registry::{verify_content, Descriptor, Registry, RegistryError, Repository, Tag};
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct RepoState {
    tags: Vec<Tag>,
    manifests: HashMap<String, (Descriptor, Vec<u8>)>,
    blobs: HashMap<String, Vec<u8>>,
    pushed_manifests: Vec<(String, Descriptor)>,
    fail_tags: bool,
    failing_blobs: HashSet<String>,
}

/// Registry double keyed by `host/name`.
#[derive(Debug, Default)]
pub struct MockRegistry {
    repos: Mutex<HashMap<String, RepoState>>,
    delay: Option<Duration>,
    blob_fetches: AtomicUsize,
    manifest_fetches: AtomicUsize,
    blob_pushes: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Tracks one in-flight call for the peak counter.
struct CallGuard<'a> {
    registry: &'a MockRegistry,
}

impl<'a> CallGuard<'a> {
    fn enter(registry: &'a MockRegistry) -> Self {
        let now = registry.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        registry.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self { registry }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.registry.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call sleep for `delay` before answering.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Stores a blob in a repository.
    pub fn add_blob(&self, repository: &Repository, descriptor: &Descriptor, data: &[u8]) {
        self.repos
            .lock()
            .entry(repository.to_string())
            .or_default()
            .blobs
            .insert(descriptor.digest.clone(), data.to_vec());
    }

    /// Stores a manifest and points `tag` at it.
    pub fn add_manifest(
        &self,
        repository: &Repository,
        tag: &str,
        last_modified: DateTime<Utc>,
        descriptor: &Descriptor,
        data: &[u8],
    ) {
        let mut repos = self.repos.lock();
        let state = repos.entry(repository.to_string()).or_default();
        let entry = (descriptor.clone(), data.to_vec());
        state.manifests.insert(descriptor.digest.clone(), entry.clone());
        state.manifests.insert(tag.to_string(), entry);

        state.tags.retain(|t| t.name != tag);
        let mut listed = Tag::new(tag, last_modified);
        listed.digest = Some(descriptor.digest.clone());
        state.tags.push(listed);
    }

    /// Makes tag listing fail for a repository.
    pub fn fail_list_tags(&self, repository: &Repository) {
        self.repos
            .lock()
            .entry(repository.to_string())
            .or_default()
            .fail_tags = true;
    }

    /// Makes fetching one blob fail with a server error.
    pub fn fail_blob(&self, repository: &Repository, digest: &str) {
        self.repos
            .lock()
            .entry(repository.to_string())
            .or_default()
            .failing_blobs
            .insert(digest.to_string());
    }

    /// Returns true if the repository holds the blob.
    #[must_use]
    pub fn has_blob(&self, repository: &Repository, digest: &str) -> bool {
        self.repos
            .lock()
            .get(&repository.to_string())
            .is_some_and(|state| state.blobs.contains_key(digest))
    }

    /// Returns `(reference, descriptor)` for every manifest pushed to a repository.
    #[must_use]
    pub fn pushed_manifests(&self, repository: &Repository) -> Vec<(String, Descriptor)> {
        self.repos
            .lock()
            .get(&repository.to_string())
            .map(|state| state.pushed_manifests.clone())
            .unwrap_or_default()
    }

    /// Number of blob fetches served so far.
    #[must_use]
    pub fn blob_fetches(&self) -> usize {
        self.blob_fetches.load(Ordering::SeqCst)
    }

    /// Number of manifest fetches served so far.
    #[must_use]
    pub fn manifest_fetches(&self) -> usize {
        self.manifest_fetches.load(Ordering::SeqCst)
    }

    /// Number of blob uploads accepted so far.
    #[must_use]
    pub fn blob_pushes(&self) -> usize {
        self.blob_pushes.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed in flight at once.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn list_tags(&self, repository: &Repository) -> Result<Vec<Tag>, RegistryError> {
        let _guard = CallGuard::enter(self);
        self.pause().await;

        let repos = self.repos.lock();
        let state = repos
            .get(&repository.to_string())
            .ok_or_else(|| RegistryError::not_found(repository.to_string()))?;
        if state.fail_tags {
            return Err(RegistryError::HttpError {
                status: 500,
                message: "injected tag listing failure".to_string(),
            });
        }
        Ok(state.tags.clone())
    }

    async fn fetch_manifest(
        &self,
        repository: &Repository,
        reference: &str,
    ) -> Result<(Descriptor, Vec<u8>), RegistryError> {
        let _guard = CallGuard::enter(self);
        self.manifest_fetches.fetch_add(1, Ordering::SeqCst);
        self.pause().await;

        self.repos
            .lock()
            .get(&repository.to_string())
            .and_then(|state| state.manifests.get(reference).cloned())
            .ok_or_else(|| RegistryError::not_found(format!("{repository}:{reference}")))
    }

    async fn fetch_blob(
        &self,
        repository: &Repository,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>, RegistryError> {
        let _guard = CallGuard::enter(self);
        self.blob_fetches.fetch_add(1, Ordering::SeqCst);
        self.pause().await;

        let repos = self.repos.lock();
        let state = repos
            .get(&repository.to_string())
            .ok_or_else(|| RegistryError::not_found(&descriptor.digest))?;
        if state.failing_blobs.contains(&descriptor.digest) {
            return Err(RegistryError::HttpError {
                status: 500,
                message: format!("injected failure for {}", descriptor.digest),
            });
        }
        state
            .blobs
            .get(&descriptor.digest)
            .cloned()
            .ok_or_else(|| RegistryError::not_found(&descriptor.digest))
    }

    async fn blob_exists(
        &self,
        repository: &Repository,
        descriptor: &Descriptor,
    ) -> Result<bool, RegistryError> {
        let _guard = CallGuard::enter(self);
        self.pause().await;
        Ok(self.has_blob(repository, &descriptor.digest))
    }

    async fn push_blob(
        &self,
        repository: &Repository,
        descriptor: &Descriptor,
        data: Vec<u8>,
    ) -> Result<(), RegistryError> {
        let _guard = CallGuard::enter(self);
        self.pause().await;
        verify_content(descriptor, &data)?;

        self.blob_pushes.fetch_add(1, Ordering::SeqCst);
        self.add_blob(repository, descriptor, &data);
        Ok(())
    }

    async fn push_manifest(
        &self,
        repository: &Repository,
        reference: &str,
        descriptor: &Descriptor,
        data: Vec<u8>,
    ) -> Result<(), RegistryError> {
        let _guard = CallGuard::enter(self);
        self.pause().await;
        verify_content(descriptor, &data)?;

        self.add_manifest(repository, reference, Utc::now(), descriptor, &data);
        self.repos
            .lock()
            .entry(repository.to_string())
            .or_default()
            .pushed_manifests
            .push((reference.to_string(), descriptor.clone()));
        tracing::debug!(repository = %repository, reference, "Mock accepted manifest");
        Ok(())
    }
}

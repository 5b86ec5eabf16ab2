//! Artifact fetcher.
//!
//! Copies one tag's content graph from a registry into the content store,
//! then exports the titled layers into the output directory.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use ocisync_registry::{
    is_valid_tag, successors, ContentStore, Descriptor, Manifest, MediaType, Registry,
    RegistryError, Repository, ANNOTATION_UNPACK,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cancel::cancellable;
use crate::error::{ControllerError, Result};

/// Outcome of fetching one tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    /// Manifest the tag resolved to.
    pub manifest: Descriptor,

    /// Blobs written to the cache by this call.
    pub copied: usize,

    /// Blobs that were already cached.
    pub skipped: usize,
}

/// Metadata written next to an exported tag.
#[derive(Debug, Serialize)]
struct FetchRecord<'a> {
    repository: String,
    tag: &'a str,
    timestamp: DateTime<Utc>,
    manifest: &'a Descriptor,
    files: Vec<String>,
}

/// Copies tags from a registry into the cache and output directory.
#[derive(Clone)]
pub struct ArtifactFetcher {
    registry: Arc<dyn Registry>,
    store: Arc<ContentStore>,
    output_dir: PathBuf,
}

impl std::fmt::Debug for ArtifactFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactFetcher")
            .field("store", &self.store.root())
            .field("output_dir", &self.output_dir)
            .finish_non_exhaustive()
    }
}

impl ArtifactFetcher {
    /// Creates a fetcher writing into `store` and `output_dir`.
    #[must_use]
    pub fn new(
        registry: Arc<dyn Registry>,
        store: Arc<ContentStore>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            store,
            output_dir: output_dir.into(),
        }
    }

    /// Directory a tag's files are exported into.
    #[must_use]
    pub fn export_dir(&self, repository: &Repository, tag: &str) -> PathBuf {
        self.output_dir
            .join(&repository.registry)
            .join(&repository.name)
            .join(tag)
    }

    /// Fetches a tag's manifest and every blob it references that is not
    /// already cached, records the tag in the cache, and exports its titled
    /// layers.
    ///
    /// Calling this again for an unchanged tag copies nothing.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidReference`] for a tag that is not a
    /// valid OCI tag, before any request is made. Otherwise returns the first
    /// registry, verification or I/O failure; blobs committed before the
    /// failure stay cached and are valid.
    pub async fn process_tag(
        &self,
        repository: &Repository,
        tag: &str,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<FetchReport> {
        // Tags name directories under the output tree.
        if !is_valid_tag(tag) {
            return Err(RegistryError::InvalidReference {
                reference: format!("{repository}:{tag}"),
                reason: "tag is not a valid OCI tag".to_string(),
            }
            .into());
        }

        let (manifest, data) =
            cancellable(cancel, self.registry.fetch_manifest(repository, tag)).await?;

        let mut report = FetchReport {
            manifest: manifest.clone(),
            copied: 0,
            skipped: 0,
        };
        self.commit(&manifest, &data, &mut report)?;
        self.copy_successors(repository, &manifest, &data, &mut report, cancel)
            .await?;

        self.store
            .tag(&manifest, &format!("{repository}:{tag}"))?;

        let files = self.export(repository, tag, &manifest, &data)?;
        self.write_record(repository, tag, timestamp, &manifest, files)?;

        tracing::info!(
            repository = %repository,
            tag,
            digest = %manifest.digest,
            copied = report.copied,
            skipped = report.skipped,
            "Fetched tag"
        );
        Ok(report)
    }

    /// Caches a tag's manifest and returns its descriptor carrying the
    /// manifest's annotations.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be fetched, cached or decoded.
    pub async fn fetch_annotations(
        &self,
        repository: &Repository,
        tag: &str,
        cancel: &CancellationToken,
    ) -> Result<Descriptor> {
        let (mut descriptor, data) =
            cancellable(cancel, self.registry.fetch_manifest(repository, tag)).await?;
        self.store.put(&descriptor, &data)?;

        let manifest: Manifest = serde_json::from_slice(&data)
            .map_err(RegistryError::from)?;
        descriptor.annotations = manifest.annotations;
        descriptor.artifact_type = manifest.artifact_type;

        tracing::debug!(
            repository = %repository,
            tag,
            annotations = descriptor.annotations.len(),
            "Fetched manifest annotations"
        );
        Ok(descriptor)
    }

    fn commit(&self, descriptor: &Descriptor, data: &[u8], report: &mut FetchReport) -> Result<()> {
        if self.store.put(descriptor, data)? {
            report.copied += 1;
        } else {
            report.skipped += 1;
        }
        Ok(())
    }

    /// Walks the content graph below `root` depth-first.
    async fn copy_successors(
        &self,
        repository: &Repository,
        root: &Descriptor,
        root_data: &[u8],
        report: &mut FetchReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut pending = successors(root, root_data)?;
        pending.reverse();

        while let Some(node) = pending.pop() {
            let is_graph_node = node.media_type.is_manifest() || node.media_type.is_index();

            let data = if self.store.contains(&node.digest)? {
                report.skipped += 1;
                tracing::debug!(digest = %node.digest, "Skipping cached blob");
                if !is_graph_node {
                    continue;
                }
                self.store.get(&node)?
            } else {
                let data = if is_graph_node {
                    let (_, data) = cancellable(
                        cancel,
                        self.registry.fetch_manifest(repository, &node.digest),
                    )
                    .await?;
                    data
                } else {
                    cancellable(cancel, self.registry.fetch_blob(repository, &node)).await?
                };
                self.store.put(&node, &data)?;
                report.copied += 1;
                data
            };

            if is_graph_node {
                let mut children = successors(&node, &data)?;
                children.reverse();
                pending.extend(children);
            }
        }

        Ok(())
    }

    /// Writes every titled layer of an image manifest into the export dir.
    fn export(
        &self,
        repository: &Repository,
        tag: &str,
        manifest: &Descriptor,
        data: &[u8],
    ) -> Result<Vec<String>> {
        if !manifest.media_type.is_manifest() {
            return Ok(Vec::new());
        }
        let parsed: Manifest =
            serde_json::from_slice(data).map_err(RegistryError::from)?;

        let dir = self.export_dir(repository, tag);
        std::fs::create_dir_all(&dir).map_err(|e| ControllerError::io(&dir, e))?;

        let mut files = Vec::new();
        for layer in &parsed.layers {
            let Some(title) = layer.title() else {
                tracing::debug!(digest = %layer.digest, "Layer has no title, not exported");
                continue;
            };
            if !is_safe_title(title) {
                tracing::warn!(title, digest = %layer.digest, "Refusing to export unsafe title");
                continue;
            }

            let content = self.store.get(layer)?;
            if is_unpackable(layer) {
                let archive = GzDecoder::new(content.as_slice());
                tar::Archive::new(archive)
                    .unpack(&dir)
                    .map_err(|e| ControllerError::io(&dir, e))?;
            } else {
                let target = dir.join(title);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| ControllerError::io(parent, e))?;
                }
                std::fs::write(&target, &content).map_err(|e| ControllerError::io(&target, e))?;
            }
            files.push(title.to_string());
        }

        Ok(files)
    }

    fn write_record(
        &self,
        repository: &Repository,
        tag: &str,
        timestamp: DateTime<Utc>,
        manifest: &Descriptor,
        files: Vec<String>,
    ) -> Result<()> {
        let record = FetchRecord {
            repository: repository.to_string(),
            tag,
            timestamp,
            manifest,
            files,
        };
        let path = self
            .output_dir
            .join(&repository.registry)
            .join(&repository.name)
            .join(format!("{tag}.json"));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ControllerError::io(parent, e))?;
        }
        let json = serde_json::to_vec_pretty(&record).map_err(RegistryError::from)?;
        std::fs::write(&path, json).map_err(|e| ControllerError::io(&path, e))
    }
}

fn is_unpackable(layer: &Descriptor) -> bool {
    layer.annotations.get(ANNOTATION_UNPACK).map(String::as_str) == Some("true")
        && layer.media_type.as_str() == MediaType::OCI_LAYER_TAR_GZIP
}

/// A title is exported only as a relative path without `..` components.
fn is_safe_title(title: &str) -> bool {
    let path = Path::new(title);
    !title.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocisync_registry::{ReadOnlyTarget, ANNOTATION_REF_NAME};
    use ocisync_test::{hours_ago, ArtifactBuilder, MockRegistry};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        registry: Arc<MockRegistry>,
        store: Arc<ContentStore>,
        fetcher: ArtifactFetcher,
        output: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(MockRegistry::new());
        let store = Arc::new(ContentStore::open(dir.path().join("cache")).unwrap());
        let output = dir.path().join("out");
        let fetcher = ArtifactFetcher::new(registry.clone(), store.clone(), &output);
        Fixture {
            _dir: dir,
            registry,
            store,
            fetcher,
            output,
        }
    }

    fn repo() -> Repository {
        Repository::new("quay.io", "ns/app")
    }

    #[tokio::test]
    async fn test_process_tag_caches_and_exports() {
        let fx = fixture();
        let artifact = ArtifactBuilder::new()
            .with_file("junit.xml", b"<testsuite/>")
            .with_directory("logs", &[("a.log", b"alpha".as_slice())])
            .with_untitled(b"opaque")
            .publish(&fx.registry, &repo(), "v1", hours_ago(1));

        let report = fx
            .fetcher
            .process_tag(&repo(), "v1", Utc::now(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.manifest, artifact.manifest);
        assert_eq!(report.copied, 5);
        assert_eq!(report.skipped, 0);

        let export = fx.output.join("quay.io/ns/app/v1");
        assert_eq!(std::fs::read(export.join("junit.xml")).unwrap(), b"<testsuite/>");
        assert_eq!(std::fs::read(export.join("logs/a.log")).unwrap(), b"alpha");

        let record: serde_json::Value =
            serde_json::from_slice(&std::fs::read(fx.output.join("quay.io/ns/app/v1.json")).unwrap())
                .unwrap();
        assert_eq!(record["tag"], "v1");
        assert_eq!(record["manifest"]["digest"], artifact.manifest.digest.as_str());

        let resolved = fx.store.resolve("quay.io/ns/app:v1").await.unwrap();
        assert_eq!(resolved.digest, artifact.manifest.digest);
        assert!(!resolved.annotations.contains_key(ANNOTATION_REF_NAME));
    }

    #[tokio::test]
    async fn test_process_tag_is_idempotent() {
        let fx = fixture();
        ArtifactBuilder::new()
            .with_file("a.txt", b"a")
            .publish(&fx.registry, &repo(), "v1", hours_ago(1));
        let cancel = CancellationToken::new();

        fx.fetcher.process_tag(&repo(), "v1", Utc::now(), &cancel).await.unwrap();
        let fetches = fx.registry.blob_fetches();

        let second = fx.fetcher.process_tag(&repo(), "v1", Utc::now(), &cancel).await.unwrap();
        assert_eq!(second.copied, 0);
        assert_eq!(second.skipped, 3);
        assert_eq!(fx.registry.blob_fetches(), fetches);
    }

    #[tokio::test]
    async fn test_failed_blob_aborts_tag() {
        let fx = fixture();
        let artifact = ArtifactBuilder::new()
            .with_file("a.txt", b"a")
            .with_file("b.txt", b"b")
            .publish(&fx.registry, &repo(), "v1", hours_ago(1));
        let (bad, _) = artifact.layer("b.txt").unwrap();
        fx.registry.fail_blob(&repo(), &bad.digest);

        let err = fx
            .fetcher
            .process_tag(&repo(), "v1", Utc::now(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ControllerError::Registry(_)));
        assert!(!fx.store.contains(&bad.digest).unwrap());
        assert!(fx.store.resolve("quay.io/ns/app:v1").await.is_err());
    }

    #[tokio::test]
    async fn test_unsafe_titles_are_skipped() {
        let fx = fixture();
        ArtifactBuilder::new()
            .with_file("../escape.txt", b"x")
            .with_file("/etc/passwd", b"y")
            .with_file("ok.txt", b"z")
            .publish(&fx.registry, &repo(), "v1", hours_ago(1));

        fx.fetcher
            .process_tag(&repo(), "v1", Utc::now(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(fx.output.join("quay.io/ns/app/v1/ok.txt").is_file());
        assert!(!fx.output.join("quay.io/ns/app/escape.txt").exists());
    }

    #[tokio::test]
    async fn test_tag_outside_output_tree_is_rejected() {
        let fx = fixture();
        ArtifactBuilder::new()
            .with_file("a.txt", b"a")
            .publish(&fx.registry, &repo(), "../../../../escaped", hours_ago(1));
        let fetches = fx.registry.manifest_fetches();

        let err = fx
            .fetcher
            .process_tag(&repo(), "../../../../escaped", Utc::now(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ControllerError::Registry(RegistryError::InvalidReference { .. })
        ));
        assert_eq!(fx.registry.manifest_fetches(), fetches);
        let parent = fx.output.parent().unwrap();
        assert!(!parent.join("escaped.json").exists());
        assert!(!parent.join("escaped").exists());
        assert!(fx.store.references().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_annotations() {
        let fx = fixture();
        ArtifactBuilder::new()
            .with_file("a.txt", b"a")
            .with_annotation("org.opencontainers.image.version", "1.2.0")
            .with_artifact_type("application/vnd.example.report")
            .publish(&fx.registry, &repo(), "v1", hours_ago(1));

        let desc = fx
            .fetcher
            .fetch_annotations(&repo(), "v1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(desc.annotations["org.opencontainers.image.version"], "1.2.0");
        assert_eq!(desc.artifact_type.as_deref(), Some("application/vnd.example.report"));
        assert!(fx.store.contains(&desc.digest).unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fx
            .fetcher
            .process_tag(&repo(), "v1", Utc::now(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_safe_title() {
        assert!(is_safe_title("report.xml"));
        assert!(is_safe_title("nested/dir/file.txt"));
        assert!(!is_safe_title(""));
        assert!(!is_safe_title("../x"));
        assert!(!is_safe_title("a/../../x"));
        assert!(!is_safe_title("/abs"));
    }
}

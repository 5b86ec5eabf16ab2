//! Upload: pack local files into an artifact and push it.
//!
//! The packed manifest lives in a [`MemoryStore`], the files in a
//! [`FileStore`], and both are composed with the on-disk cache through a
//! [`UnionTarget`] so the push streams every blob through one source.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use ocisync_registry::{
    read_all, successors, Annotations, ContentStore, Descriptor, FileStore, MemoryStore,
    ReadOnlyTarget, Reference, Registry, UnionTarget,
};
use tokio_util::sync::CancellationToken;

use crate::cancel::cancellable;
use crate::error::{ControllerError, Result};
use crate::fetcher::ArtifactFetcher;
use crate::packer::{
    find_dir_with_files, load_annotation_file, load_files, pack_manifest, FileAnnotations,
    FileInput,
};

/// What to upload and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    /// Destination repository and tag.
    pub destination: Reference,

    /// Artifact type of the packed manifest.
    pub artifact_type: Option<String>,

    /// File references, `path[:media-type]`.
    pub files: Vec<String>,

    /// Tag whose manifest annotations are carried onto the new manifest.
    pub annotations_from: Option<Reference>,

    /// Also fetch `annotations_from` and pack its exported files.
    pub include_source: bool,

    /// JSON annotation file.
    pub annotation_file: Option<PathBuf>,
}

impl UploadRequest {
    /// Creates a request for `destination` with no inputs.
    #[must_use]
    pub const fn new(destination: Reference) -> Self {
        Self {
            destination,
            artifact_type: None,
            files: Vec::new(),
            annotations_from: None,
            include_source: false,
            annotation_file: None,
        }
    }

    /// Adds a file reference.
    #[must_use]
    pub fn with_file(mut self, reference: impl Into<String>) -> Self {
        self.files.push(reference.into());
        self
    }

    /// Sets the artifact type.
    #[must_use]
    pub fn with_artifact_type(mut self, artifact_type: impl Into<String>) -> Self {
        self.artifact_type = Some(artifact_type.into());
        self
    }

    /// Carries annotations over from `source`.
    #[must_use]
    pub fn with_annotations_from(mut self, source: Reference) -> Self {
        self.annotations_from = Some(source);
        self
    }

    /// Packs the exported content of the annotation source as well.
    #[must_use]
    pub const fn with_source_content(mut self, include: bool) -> Self {
        self.include_source = include;
        self
    }

    /// Reads per-file, manifest and config annotations from `path`.
    #[must_use]
    pub fn with_annotation_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.annotation_file = Some(path.into());
        self
    }

    /// Checks the request before any I/O.
    ///
    /// # Errors
    ///
    /// Returns a validation error when there is nothing to pack or a file
    /// reference is malformed.
    pub fn validate(&self) -> Result<Vec<FileInput>> {
        if self.include_source && self.annotations_from.is_none() {
            return Err(ControllerError::validation(
                "including source content requires an annotation source",
            ));
        }
        if self.files.is_empty() && !self.include_source {
            return Err(ControllerError::validation(
                "at least one file must be given to upload",
            ));
        }
        self.files.iter().map(|f| FileInput::parse(f)).collect()
    }
}

/// Outcome of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// Pushed manifest.
    pub manifest: Descriptor,

    /// Blobs and manifests sent to the registry.
    pub pushed: usize,

    /// Blobs the registry already held.
    pub skipped: usize,
}

/// Runs the full upload flow.
pub(crate) async fn upload(
    registry: &dyn Registry,
    fetcher: &ArtifactFetcher,
    cache: Arc<ContentStore>,
    request: &UploadRequest,
    cancel: &CancellationToken,
) -> Result<UploadReport> {
    let mut inputs = request.validate()?;

    let mut manifest_annotations = Annotations::new();
    if let Some(source) = &request.annotations_from {
        let descriptor = fetcher
            .fetch_annotations(&source.repository, &source.tag, cancel)
            .await?;
        manifest_annotations.extend(descriptor.annotations);

        if request.include_source {
            fetcher
                .process_tag(&source.repository, &source.tag, Utc::now(), cancel)
                .await?;
            let exported = fetcher.export_dir(&source.repository, &source.tag);
            let dir = find_dir_with_files(&exported)?
                .ok_or(ControllerError::EmptyDirectory { path: exported })?;
            tracing::debug!(path = %dir.display(), "Packing exported source content");
            inputs.push(FileInput::new(dir));
        }
    }

    let file_annotations = match &request.annotation_file {
        Some(path) => load_annotation_file(path)?,
        None => FileAnnotations::default(),
    };
    manifest_annotations.extend(file_annotations.manifest);

    let files = Arc::new(FileStore::new());
    let layers = load_files(&files, &file_annotations.files, &inputs)?;

    let memory = Arc::new(MemoryStore::new());
    let root = pack_manifest(
        &memory,
        request.artifact_type.as_deref(),
        layers,
        manifest_annotations,
        file_annotations.config,
    )?;

    let union = UnionTarget::new(vec![
        memory as Arc<dyn ReadOnlyTarget>,
        files as Arc<dyn ReadOnlyTarget>,
        cache as Arc<dyn ReadOnlyTarget>,
    ]);
    let report = copy_graph(&union, &root, registry, &request.destination, cancel).await?;

    tracing::info!(
        destination = %request.destination,
        digest = %report.manifest.digest,
        pushed = report.pushed,
        skipped = report.skipped,
        "Uploaded artifact"
    );
    Ok(report)
}

/// Pushes the graph rooted at `root` from `source` to `destination`.
///
/// Children are pushed before their parents. Blobs the registry already
/// holds are skipped; the root manifest is always pushed under the
/// destination tag.
///
/// # Errors
///
/// Returns the first source, registry or cancellation error.
pub async fn copy_graph(
    source: &dyn ReadOnlyTarget,
    root: &Descriptor,
    registry: &dyn Registry,
    destination: &Reference,
    cancel: &CancellationToken,
) -> Result<UploadReport> {
    let repository = &destination.repository;
    let mut report = UploadReport {
        manifest: root.clone(),
        pushed: 0,
        skipped: 0,
    };

    // A node carrying its content has had its children scheduled already.
    let mut stack: Vec<(Descriptor, Option<Vec<u8>>)> = vec![(root.clone(), None)];

    while let Some((node, loaded)) = stack.pop() {
        let is_graph_node = node.media_type.is_manifest() || node.media_type.is_index();

        if !is_graph_node {
            if cancellable(cancel, registry.blob_exists(repository, &node)).await? {
                tracing::debug!(digest = %node.digest, "Blob already at destination");
                report.skipped += 1;
                continue;
            }
            let data = cancellable(cancel, read_all(source, &node)).await?;
            cancellable(cancel, registry.push_blob(repository, &node, data)).await?;
            report.pushed += 1;
            continue;
        }

        match loaded {
            None => {
                let data = cancellable(cancel, read_all(source, &node)).await?;
                let children = successors(&node, &data)?;
                stack.push((node, Some(data)));
                stack.extend(children.into_iter().rev().map(|child| (child, None)));
            }
            Some(data) => {
                let reference = if node.digest == root.digest {
                    destination.tag.as_str()
                } else {
                    node.digest.as_str()
                };
                cancellable(
                    cancel,
                    registry.push_manifest(repository, reference, &node, data),
                )
                .await?;
                report.pushed += 1;
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocisync_registry::{Manifest, MediaType, Repository, ANNOTATION_CREATED};
    use ocisync_test::{hours_ago, ArtifactBuilder, MockRegistry};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        registry: Arc<MockRegistry>,
        cache: Arc<ContentStore>,
        fetcher: ArtifactFetcher,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(MockRegistry::new());
        let cache = Arc::new(ContentStore::open(dir.path().join("cache")).unwrap());
        let fetcher = ArtifactFetcher::new(registry.clone(), cache.clone(), dir.path().join("out"));
        Fixture {
            dir,
            registry,
            cache,
            fetcher,
        }
    }

    fn destination() -> Reference {
        Reference::parse("quay.io/ns/results:run-1").unwrap()
    }

    async fn pushed_manifest(registry: &MockRegistry, reference: &Reference) -> Manifest {
        let (_, data) = registry
            .fetch_manifest(&reference.repository, &reference.tag)
            .await
            .unwrap();
        serde_json::from_slice(&data).unwrap()
    }

    #[test]
    fn test_validate() {
        assert!(UploadRequest::new(destination()).validate().is_err());
        assert!(UploadRequest::new(destination())
            .with_source_content(true)
            .validate()
            .is_err());

        let err = UploadRequest::new(destination())
            .with_file(":text/plain")
            .validate()
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidFileReference { .. }));

        let inputs = UploadRequest::new(destination())
            .with_file("a.txt:text/plain")
            .validate()
            .unwrap();
        assert_eq!(inputs[0].media_type, "text/plain");
    }

    #[tokio::test]
    async fn test_upload_files() {
        let fx = fixture();
        let file = fx.dir.path().join("junit.xml");
        std::fs::write(&file, b"<testsuite/>").unwrap();

        let request = UploadRequest::new(destination())
            .with_file(file.to_string_lossy())
            .with_artifact_type("application/vnd.example.results");
        let report = upload(
            fx.registry.as_ref(),
            &fx.fetcher,
            fx.cache.clone(),
            &request,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.pushed, 3);
        assert_eq!(report.skipped, 0);

        let pushed = fx.registry.pushed_manifests(&destination().repository);
        assert_eq!(pushed, vec![("run-1".to_string(), report.manifest.clone())]);

        let manifest = pushed_manifest(&fx.registry, &destination()).await;
        assert_eq!(manifest.artifact_type.as_deref(), Some("application/vnd.example.results"));
        assert_eq!(manifest.layers.len(), 1);
        assert!(manifest.annotations.contains_key(ANNOTATION_CREATED));
        assert!(fx
            .registry
            .has_blob(&destination().repository, &manifest.layers[0].digest));
    }

    #[tokio::test]
    async fn test_upload_carries_source_annotations_and_content() {
        let fx = fixture();
        let source = Reference::parse("quay.io/ns/app:v1").unwrap();
        ArtifactBuilder::new()
            .with_directory("logs", &[("a.log", b"alpha".as_slice())])
            .with_annotation("pipeline", "nightly")
            .publish(&fx.registry, &source.repository, "v1", hours_ago(1));

        let extra = fx.dir.path().join("summary.txt");
        std::fs::write(&extra, b"ok").unwrap();
        let annotations = fx.dir.path().join("annotations.json");
        std::fs::write(
            &annotations,
            format!(
                r#"{{"$manifest": {{"run": "42"}}, "{}": {{"kind": "summary"}}}}"#,
                extra.display()
            ),
        )
        .unwrap();

        let request = UploadRequest::new(destination())
            .with_file(extra.to_string_lossy())
            .with_annotations_from(source)
            .with_source_content(true)
            .with_annotation_file(&annotations);
        upload(
            fx.registry.as_ref(),
            &fx.fetcher,
            fx.cache.clone(),
            &request,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let manifest = pushed_manifest(&fx.registry, &destination()).await;
        assert_eq!(manifest.annotations["pipeline"], "nightly");
        assert_eq!(manifest.annotations["run"], "42");
        assert_eq!(manifest.layers.len(), 2);
        assert_eq!(manifest.layers[0].annotations["kind"], "summary");
        assert_eq!(
            manifest.layers[1].media_type.as_str(),
            MediaType::OCI_LAYER_TAR_GZIP
        );
        assert!(manifest.layers[1].title().is_some_and(|t| t.ends_with("logs")));
    }

    #[tokio::test]
    async fn test_copy_graph_skips_existing_blobs() {
        let fx = fixture();
        let artifact = ArtifactBuilder::new().with_file("a.txt", b"a").build();

        let memory = MemoryStore::new();
        memory.push(&artifact.config, b"{}".to_vec()).unwrap();
        for (desc, data) in &artifact.layers {
            memory.push(desc, data.clone()).unwrap();
        }
        memory
            .push(&artifact.manifest, artifact.manifest_bytes.clone())
            .unwrap();

        let dest = destination();
        fx.registry.add_blob(&dest.repository, &artifact.config, b"{}");

        let report = copy_graph(
            &memory,
            &artifact.manifest,
            fx.registry.as_ref(),
            &dest,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.pushed, 2);
        assert_eq!(fx.registry.blob_pushes(), 1);
    }

    #[tokio::test]
    async fn test_copy_graph_missing_blob_fails() {
        let fx = fixture();
        let artifact = ArtifactBuilder::new().with_file("a.txt", b"a").build();
        let memory = MemoryStore::new();
        memory
            .push(&artifact.manifest, artifact.manifest_bytes.clone())
            .unwrap();

        let err = copy_graph(
            &memory,
            &artifact.manifest,
            fx.registry.as_ref(),
            &destination(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ControllerError::Registry(ref e) if e.is_not_found()));
        assert!(fx.registry.pushed_manifests(&destination().repository).is_empty());
    }

    #[tokio::test]
    async fn test_source_without_files_is_empty_directory() {
        let fx = fixture();
        let source = Reference::new(Repository::new("quay.io", "ns/app"), "v1");
        ArtifactBuilder::new()
            .with_untitled(b"opaque")
            .publish(&fx.registry, &source.repository, "v1", hours_ago(1));

        let request = UploadRequest::new(destination())
            .with_annotations_from(source)
            .with_source_content(true);
        let err = upload(
            fx.registry.as_ref(),
            &fx.fetcher,
            fx.cache.clone(),
            &request,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ControllerError::EmptyDirectory { .. }));
    }
}

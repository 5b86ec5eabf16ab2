//! Artifact fixtures.
//!
//! Builds complete OCI artifacts (empty config, titled layers, manifest) and
//! publishes them into a [`MockRegistry`].

use chrono::{DateTime, Duration, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use ocisync_registry::{
    Descriptor, Manifest, MediaType, Repository, ANNOTATION_TITLE, ANNOTATION_UNPACK, EMPTY_JSON,
};

use crate::mock_registry::MockRegistry;

/// A built artifact: manifest plus every blob it references.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Manifest descriptor.
    pub manifest: Descriptor,

    /// Serialized manifest.
    pub manifest_bytes: Vec<u8>,

    /// Config descriptor (always the empty JSON object).
    pub config: Descriptor,

    /// Layers with their content, in manifest order.
    pub layers: Vec<(Descriptor, Vec<u8>)>,
}

impl Artifact {
    /// Returns the layer with the given title.
    #[must_use]
    pub fn layer(&self, title: &str) -> Option<&(Descriptor, Vec<u8>)> {
        self.layers.iter().find(|(desc, _)| desc.title() == Some(title))
    }
}

/// Fluent builder for test artifacts.
///
/// # Examples
///
/// ```rust
/// use ocisync_test::ArtifactBuilder;
///
/// let artifact = ArtifactBuilder::new()
///     .with_file("report.xml", b"<testsuite/>")
///     .with_directory("logs", &[("a.log", b"alpha".as_slice())])
///     .with_annotation("org.opencontainers.image.version", "1.0.0")
///     .build();
///
/// assert_eq!(artifact.layers.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ArtifactBuilder {
    layers: Vec<(Descriptor, Vec<u8>)>,
    annotations: Vec<(String, String)>,
    artifact_type: Option<String>,
}

impl ArtifactBuilder {
    /// Creates a builder with no layers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a plain file layer.
    #[must_use]
    pub fn with_file(mut self, title: &str, data: &[u8]) -> Self {
        let desc = Descriptor::from_bytes(MediaType::new(MediaType::OCI_LAYER_TAR), data)
            .with_annotation(ANNOTATION_TITLE, title);
        self.layers.push((desc, data.to_vec()));
        self
    }

    /// Adds a gzip tarball layer holding `files` under the directory `title`,
    /// marked for unpacking.
    ///
    /// # Panics
    ///
    /// Panics if the in-memory tarball cannot be written.
    #[must_use]
    pub fn with_directory(mut self, title: &str, files: &[(&str, &[u8])]) -> Self {
        let packed = tar_gz(title, files);
        let desc = Descriptor::from_bytes(MediaType::new(MediaType::OCI_LAYER_TAR_GZIP), &packed)
            .with_annotation(ANNOTATION_TITLE, title)
            .with_annotation(ANNOTATION_UNPACK, "true");
        self.layers.push((desc, packed));
        self
    }

    /// Adds an untitled layer, which exporters are expected to skip.
    #[must_use]
    pub fn with_untitled(mut self, data: &[u8]) -> Self {
        let desc = Descriptor::from_bytes(MediaType::new(MediaType::OCI_LAYER_TAR), data);
        self.layers.push((desc, data.to_vec()));
        self
    }

    /// Adds a manifest annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.push((key.into(), value.into()));
        self
    }

    /// Sets the artifact type.
    #[must_use]
    pub fn with_artifact_type(mut self, artifact_type: impl Into<String>) -> Self {
        self.artifact_type = Some(artifact_type.into());
        self
    }

    /// Serializes the manifest.
    ///
    /// # Panics
    ///
    /// Panics if the manifest cannot be serialized.
    #[must_use]
    pub fn build(self) -> Artifact {
        let config = Descriptor::empty_config();
        let mut manifest = Manifest::new(self.layers.iter().map(|(d, _)| d.clone()).collect())
            .with_config(config.clone());
        if let Some(artifact_type) = self.artifact_type {
            manifest = manifest.with_artifact_type(artifact_type);
        }
        for (key, value) in self.annotations {
            manifest = manifest.with_annotation(key, value);
        }

        let manifest_bytes = serde_json::to_vec(&manifest).expect("manifest serializes");
        let manifest =
            Descriptor::from_bytes(MediaType::new(MediaType::OCI_MANIFEST), &manifest_bytes);

        Artifact {
            manifest,
            manifest_bytes,
            config,
            layers: self.layers,
        }
    }

    /// Builds the artifact and publishes it under `tag`.
    pub fn publish(
        self,
        registry: &MockRegistry,
        repository: &Repository,
        tag: &str,
        last_modified: DateTime<Utc>,
    ) -> Artifact {
        let artifact = self.build();
        registry.add_blob(repository, &artifact.config, EMPTY_JSON);
        for (desc, data) in &artifact.layers {
            registry.add_blob(repository, desc, data);
        }
        registry.add_manifest(
            repository,
            tag,
            last_modified,
            &artifact.manifest,
            &artifact.manifest_bytes,
        );
        artifact
    }
}

/// Timestamp `hours` hours before now.
#[must_use]
pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    Utc::now() - Duration::hours(hours)
}

fn tar_gz(root: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{root}/{name}"), *data)
            .expect("append tar entry");
    }
    builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .expect("finish tarball")
}

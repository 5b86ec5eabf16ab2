//! OCI Distribution and Image Specification types.
//!
//! This module defines the descriptor, manifest and index types exchanged with
//! registries and stored in the local cache, plus the digest helpers that
//! enforce content addressing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::error::RegistryError;

/// Annotation map carried by descriptors and manifests.
pub type Annotations = BTreeMap<String, String>;

/// Human-readable title of a layer (usually its file name).
pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";

/// Reference name recorded for tagged entries of an image layout index.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Creation timestamp annotation.
pub const ANNOTATION_CREATED: &str = "org.opencontainers.image.created";

/// Marks a gzip tarball layer that should be extracted on export.
pub const ANNOTATION_UNPACK: &str = "io.deis.oras.content.unpack";

/// Reserved annotation-file key addressing the packed manifest.
pub const ANNOTATION_MANIFEST: &str = "$manifest";

/// Reserved annotation-file key addressing the packed config blob.
pub const ANNOTATION_CONFIG: &str = "$config";

/// OCI media types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaType(String);

impl MediaType {
    /// OCI image manifest media type.
    pub const OCI_MANIFEST: &'static str = "application/vnd.oci.image.manifest.v1+json";

    /// OCI image index media type.
    pub const OCI_INDEX: &'static str = "application/vnd.oci.image.index.v1+json";

    /// Docker v2 schema 2 manifest media type.
    pub const DOCKER_MANIFEST: &'static str =
        "application/vnd.docker.distribution.manifest.v2+json";

    /// Docker v2 manifest list media type.
    pub const DOCKER_MANIFEST_LIST: &'static str =
        "application/vnd.docker.distribution.manifest.list.v2+json";

    /// Empty JSON blob media type used for artifact configs.
    pub const OCI_EMPTY: &'static str = "application/vnd.oci.empty.v1+json";

    /// Plain tar layer media type (default for packed files).
    pub const OCI_LAYER_TAR: &'static str = "application/vnd.oci.image.layer.v1.tar";

    /// Gzip-compressed tar layer media type (packed directories).
    pub const OCI_LAYER_TAR_GZIP: &'static str = "application/vnd.oci.image.layer.v1.tar+gzip";

    /// Artifact type used when the caller does not provide one.
    pub const UNKNOWN_ARTIFACT: &'static str = "application/vnd.unknown.artifact.v1";

    /// Creates a new media type.
    #[must_use]
    pub fn new(media_type: impl Into<String>) -> Self {
        Self(media_type.into())
    }

    /// Returns the media type string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for image manifests (OCI or Docker).
    #[must_use]
    pub fn is_manifest(&self) -> bool {
        matches!(self.as_str(), Self::OCI_MANIFEST | Self::DOCKER_MANIFEST)
    }

    /// Returns true for image indexes and manifest lists.
    #[must_use]
    pub fn is_index(&self) -> bool {
        matches!(self.as_str(), Self::OCI_INDEX | Self::DOCKER_MANIFEST_LIST)
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MediaType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Serialize for MediaType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MediaType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self(s))
    }
}

/// OCI content descriptor.
///
/// A descriptor describes the disposition of targeted content. It includes
/// the type of the content, a content identifier (digest), and the byte-size
/// of the raw content. Two descriptors with equal digests denote
/// byte-identical content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: MediaType,

    /// Digest of the targeted content.
    pub digest: String,

    /// Size in bytes of the content.
    pub size: u64,

    /// Optional URLs for alternative locations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,

    /// Annotations (key-value metadata).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: Annotations,

    /// Artifact type of the referenced manifest, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

impl Descriptor {
    /// Creates a new descriptor.
    ///
    /// # Examples
    ///
    /// ```
    /// use ocisync_registry::{Descriptor, MediaType};
    ///
    /// let desc = Descriptor::new(
    ///     MediaType::new(MediaType::OCI_LAYER_TAR),
    ///     "sha256:abc123...",
    ///     1024,
    /// );
    /// assert_eq!(desc.size, 1024);
    /// ```
    #[must_use]
    pub fn new(media_type: MediaType, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type,
            digest: digest.into(),
            size,
            urls: None,
            annotations: Annotations::new(),
            artifact_type: None,
        }
    }

    /// Creates a descriptor for the given bytes, computing a SHA-256 digest.
    #[must_use]
    pub fn from_bytes(media_type: MediaType, data: &[u8]) -> Self {
        Self::new(media_type, compute_digest(data), data.len() as u64)
    }

    /// Descriptor of the empty JSON object `{}` used as an artifact config.
    #[must_use]
    pub fn empty_config() -> Self {
        Self::from_bytes(MediaType::new(MediaType::OCI_EMPTY), EMPTY_JSON)
    }

    /// Adds an annotation to the descriptor.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Returns the title annotation, if present.
    #[must_use]
    pub fn title(&self) -> Option<&str> {
        self.annotations.get(ANNOTATION_TITLE).map(String::as_str)
    }

    /// Returns the digest algorithm (e.g., "sha256").
    #[must_use]
    pub fn digest_algorithm(&self) -> &str {
        self.digest.split(':').next().unwrap_or("sha256")
    }

    /// Returns the digest value (without algorithm prefix).
    #[must_use]
    pub fn digest_value(&self) -> &str {
        self.digest.split(':').nth(1).unwrap_or(&self.digest)
    }
}

/// Bytes of the empty JSON config blob.
pub const EMPTY_JSON: &[u8] = b"{}";

/// OCI Image Manifest.
///
/// This structure describes a single container image or artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Schema version (always 2).
    pub schema_version: u32,

    /// Media type of this manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,

    /// Optional artifact type (OCI 1.1+).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    /// Configuration descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,

    /// Layers that make up the artifact, in order.
    #[serde(default)]
    pub layers: Vec<Descriptor>,

    /// Optional subject descriptor for referrers API (OCI 1.1+).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,

    /// Manifest annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: Annotations,
}

impl Manifest {
    /// Creates a new OCI image manifest with the given layers.
    ///
    /// # Examples
    ///
    /// ```
    /// use ocisync_registry::{Descriptor, Manifest, MediaType};
    ///
    /// let layer = Descriptor::from_bytes(MediaType::new(MediaType::OCI_LAYER_TAR), b"hello");
    /// let manifest = Manifest::new(vec![layer]);
    /// assert_eq!(manifest.schema_version, 2);
    /// ```
    #[must_use]
    pub fn new(layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MediaType::new(MediaType::OCI_MANIFEST)),
            artifact_type: None,
            config: None,
            layers,
            subject: None,
            annotations: Annotations::new(),
        }
    }

    /// Sets the artifact type.
    #[must_use]
    pub fn with_artifact_type(mut self, artifact_type: impl Into<String>) -> Self {
        self.artifact_type = Some(artifact_type.into());
        self
    }

    /// Sets the config descriptor.
    #[must_use]
    pub fn with_config(mut self, config: Descriptor) -> Self {
        self.config = Some(config);
        self
    }

    /// Adds an annotation to the manifest.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}

/// OCI Image Index (or Docker manifest list).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    /// Schema version (always 2).
    pub schema_version: u32,

    /// Media type of this index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,

    /// Referenced manifests.
    #[serde(default)]
    pub manifests: Vec<Descriptor>,

    /// Index annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: Annotations,
}

impl Default for Index {
    fn default() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MediaType::new(MediaType::OCI_INDEX)),
            manifests: Vec::new(),
            annotations: Annotations::new(),
        }
    }
}

/// Returns the descriptors directly referenced by a piece of content.
///
/// Manifests reference their config and layers, indexes reference their
/// manifests, and every other media type is a leaf.
///
/// # Errors
///
/// Returns an error if manifest or index content cannot be decoded.
pub fn successors(descriptor: &Descriptor, data: &[u8]) -> Result<Vec<Descriptor>, RegistryError> {
    if descriptor.media_type.is_manifest() {
        let manifest: Manifest = serde_json::from_slice(data)?;
        let mut nodes = Vec::with_capacity(manifest.layers.len() + 1);
        nodes.extend(manifest.config);
        nodes.extend(manifest.layers);
        Ok(nodes)
    } else if descriptor.media_type.is_index() {
        let index: Index = serde_json::from_slice(data)?;
        Ok(index.manifests)
    } else {
        Ok(Vec::new())
    }
}

/// A repository tag with its last-modified time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Tag name.
    pub name: String,

    /// When the tag was last moved.
    pub last_modified: DateTime<Utc>,

    /// Manifest digest the tag points at, when the registry reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl Tag {
    /// Creates a tag without digest information.
    #[must_use]
    pub fn new(name: impl Into<String>, last_modified: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            last_modified,
            digest: None,
        }
    }
}

/// One page of the Quay `/api/v1/repository/<name>/tag/` response.
#[derive(Debug, Clone, Deserialize)]
pub struct TagPage {
    /// Tags on this page.
    #[serde(default)]
    pub tags: Vec<TagEntry>,

    /// Page number.
    #[serde(default)]
    pub page: u32,

    /// Whether more pages follow.
    #[serde(default)]
    pub has_additional: bool,
}

/// Individual tag entry of a [`TagPage`].
#[derive(Debug, Clone, Deserialize)]
pub struct TagEntry {
    /// Tag name.
    pub name: String,

    /// RFC 2822 timestamp, e.g. `Tue, 15 Oct 2024 10:00:00 -0000`.
    pub last_modified: String,

    /// Manifest digest.
    #[serde(default)]
    pub manifest_digest: Option<String>,
}

impl TagEntry {
    /// Converts the wire entry into a [`Tag`].
    ///
    /// # Errors
    ///
    /// Returns an error if the timestamp is not valid RFC 2822.
    pub fn into_tag(self) -> Result<Tag, RegistryError> {
        let last_modified = DateTime::parse_from_rfc2822(&self.last_modified)
            .map_err(|e| RegistryError::InvalidManifest {
                message: format!(
                    "tag {} has invalid last_modified '{}': {e}",
                    self.name, self.last_modified
                ),
            })?
            .with_timezone(&Utc);

        Ok(Tag {
            name: self.name,
            last_modified,
            digest: self.manifest_digest,
        })
    }
}

/// Computes the SHA-256 digest of data in `sha256:<hex>` form.
#[must_use]
pub fn compute_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Splits and validates a digest into `(algorithm, hex)`.
///
/// Only `sha256` and `sha512` are accepted, with lowercase hex of the
/// matching length, so the result is always safe to use as a path segment.
///
/// # Errors
///
/// Returns [`RegistryError::InvalidDigest`] for anything else.
pub fn parse_digest(digest: &str) -> Result<(&str, &str), RegistryError> {
    let invalid = |reason: &str| RegistryError::InvalidDigest {
        digest: digest.to_string(),
        reason: reason.to_string(),
    };

    let (algorithm, encoded) = digest
        .split_once(':')
        .ok_or_else(|| invalid("missing algorithm prefix"))?;

    let expected_len = match algorithm {
        "sha256" => 64,
        "sha512" => 128,
        _ => return Err(invalid("unsupported algorithm")),
    };

    if encoded.len() != expected_len {
        return Err(invalid("wrong length"));
    }
    if !encoded
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(invalid("not lowercase hex"));
    }

    Ok((algorithm, encoded))
}

/// Computes the digest of data using the algorithm of `like`.
///
/// # Errors
///
/// Returns an error if `like` is not a valid digest.
pub fn digest_like(like: &str, data: &[u8]) -> Result<String, RegistryError> {
    let (algorithm, _) = parse_digest(like)?;
    Ok(match algorithm {
        "sha512" => format!("sha512:{}", hex::encode(Sha512::digest(data))),
        _ => compute_digest(data),
    })
}

/// Verifies that data matches a descriptor's size and digest.
///
/// # Errors
///
/// Returns [`RegistryError::SizeMismatch`] or [`RegistryError::DigestMismatch`].
pub fn verify_content(descriptor: &Descriptor, data: &[u8]) -> Result<(), RegistryError> {
    let actual_size = data.len() as u64;
    if actual_size != descriptor.size {
        return Err(RegistryError::SizeMismatch {
            digest: descriptor.digest.clone(),
            expected: descriptor.size,
            actual: actual_size,
        });
    }

    let actual = digest_like(&descriptor.digest, data)?;
    if actual != descriptor.digest {
        return Err(RegistryError::DigestMismatch {
            expected: descriptor.digest.clone(),
            actual,
        });
    }

    Ok(())
}

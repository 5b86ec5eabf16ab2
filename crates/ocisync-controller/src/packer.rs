//! Manifest packer.
//!
//! Turns local files and directories into layer descriptors and assembles an
//! image manifest around them.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use ocisync_registry::{
    Annotations, Descriptor, FileStore, Manifest, MediaType, MemoryStore, ANNOTATION_CONFIG,
    ANNOTATION_CREATED, ANNOTATION_MANIFEST, EMPTY_JSON,
};
use walkdir::WalkDir;

use crate::error::{ControllerError, Result};

/// A local path to pack, with an optional media type override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInput {
    /// Path as given by the caller.
    pub path: PathBuf,

    /// Media type; empty selects the default for the path kind.
    pub media_type: String,
}

impl FileInput {
    /// Creates an input with the default media type.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            media_type: String::new(),
        }
    }

    /// Parses a `path[:media-type]` reference.
    ///
    /// # Errors
    ///
    /// See [`parse_file_reference`].
    pub fn parse(reference: &str) -> Result<Self> {
        let (path, media_type) = parse_file_reference(reference, "")?;
        Ok(Self {
            path: PathBuf::from(path),
            media_type,
        })
    }
}

/// Splits a file reference at its last `:` into path and media type.
///
/// Without a `:` the whole reference is the path and `default_media_type`
/// is returned.
///
/// # Errors
///
/// Returns [`ControllerError::InvalidFileReference`] naming `reference` when
/// the path part is empty.
///
/// # Examples
///
/// ```
/// use ocisync_controller::parse_file_reference;
///
/// let (path, media_type) = parse_file_reference("report.xml:application/xml", "").unwrap();
/// assert_eq!((path.as_str(), media_type.as_str()), ("report.xml", "application/xml"));
/// assert!(parse_file_reference(":application/xml", "").is_err());
/// ```
pub fn parse_file_reference(reference: &str, default_media_type: &str) -> Result<(String, String)> {
    let (path, media_type) = match reference.rfind(':') {
        Some(i) => (&reference[..i], &reference[i + 1..]),
        None => (reference, default_media_type),
    };
    if path.is_empty() {
        return Err(ControllerError::InvalidFileReference {
            reference: reference.to_string(),
        });
    }
    Ok((path.to_string(), media_type.to_string()))
}

/// Finds the first directory under `root`, `root` included, that directly
/// holds at least one non-directory entry.
///
/// Entries are visited in name order, parents before children, and the walk
/// stops at the first match.
///
/// # Errors
///
/// Returns an I/O error if `root` cannot be walked.
pub fn find_dir_with_files(root: &Path) -> Result<Option<PathBuf>> {
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            ControllerError::io(path, e.into())
        })?;
        if entry.file_type().is_dir() && contains_files(entry.path()) {
            return Ok(Some(entry.into_path()));
        }
    }
    Ok(None)
}

fn contains_files(dir: &Path) -> bool {
    std::fs::read_dir(dir).is_ok_and(|entries| {
        entries
            .filter_map(std::result::Result::ok)
            .any(|entry| entry.file_type().is_ok_and(|kind| !kind.is_dir()))
    })
}

/// Annotations loaded from an annotation file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAnnotations {
    /// Annotations for the packed manifest (`$manifest`).
    pub manifest: Annotations,

    /// Annotations for the config blob (`$config`).
    pub config: Annotations,

    /// Annotations keyed by file path as given on input.
    pub files: HashMap<String, Annotations>,
}

/// Reads an annotation file: a JSON object mapping names to string maps.
///
/// # Errors
///
/// Returns [`ControllerError::Io`] if the file cannot be read and
/// [`ControllerError::AnnotationFile`] if it is not the expected shape.
pub fn load_annotation_file(path: &Path) -> Result<FileAnnotations> {
    let data = std::fs::read(path).map_err(|e| ControllerError::io(path, e))?;
    let mut entries: BTreeMap<String, Annotations> =
        serde_json::from_slice(&data).map_err(|e| ControllerError::AnnotationFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    Ok(FileAnnotations {
        manifest: entries.remove(ANNOTATION_MANIFEST).unwrap_or_default(),
        config: entries.remove(ANNOTATION_CONFIG).unwrap_or_default(),
        files: entries.into_iter().collect(),
    })
}

/// Registers every input in `store` and returns the layer descriptors in
/// input order.
///
/// Directories are replaced by their first file-bearing subdirectory. Each
/// layer is named by its cleaned path, and annotations listed under the
/// input's path are merged onto its descriptor.
///
/// # Errors
///
/// Returns [`ControllerError::EmptyDirectory`] for a directory holding no
/// files, or the store error for an unreadable or duplicate input.
pub fn load_files(
    store: &FileStore,
    annotations: &HashMap<String, Annotations>,
    inputs: &[FileInput],
) -> Result<Vec<Descriptor>> {
    let mut layers = Vec::with_capacity(inputs.len());

    for input in inputs {
        let path = if input.path.is_dir() {
            find_dir_with_files(&input.path)?.ok_or_else(|| ControllerError::EmptyDirectory {
                path: input.path.clone(),
            })?
        } else {
            input.path.clone()
        };

        let name = clean_name(&path);
        let mut descriptor = store.add(&name, &input.media_type, &path)?;
        if let Some(extra) = annotations.get(input.path.to_string_lossy().as_ref()) {
            descriptor
                .annotations
                .extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        tracing::debug!(name, digest = %descriptor.digest, "Loaded layer");
        layers.push(descriptor);
    }

    Ok(layers)
}

/// Lexically normalizes a path into a relative, slash-separated layer name.
///
/// Root and leading `..` components are dropped, so the name can always be
/// exported below an output directory.
fn clean_name(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();

    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                parts.pop();
            }
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
        }
    }

    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// Packs an image manifest over `layers` into `store` and tags it by digest.
///
/// The config is the empty JSON object. The artifact type defaults to
/// `application/vnd.unknown.artifact.v1`, and a creation timestamp is added
/// unless the caller supplied one.
///
/// # Errors
///
/// Returns an error if the manifest cannot be serialized or stored.
pub fn pack_manifest(
    store: &MemoryStore,
    artifact_type: Option<&str>,
    layers: Vec<Descriptor>,
    mut manifest_annotations: Annotations,
    config_annotations: Annotations,
) -> Result<Descriptor> {
    let mut config = Descriptor::empty_config();
    config.annotations = config_annotations;
    store.push(&config, EMPTY_JSON.to_vec())?;

    manifest_annotations
        .entry(ANNOTATION_CREATED.to_string())
        .or_insert_with(|| Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));

    let artifact_type = artifact_type
        .filter(|t| !t.is_empty())
        .unwrap_or(MediaType::UNKNOWN_ARTIFACT);
    let mut manifest = Manifest::new(layers)
        .with_config(config)
        .with_artifact_type(artifact_type);
    manifest.annotations = manifest_annotations;

    let data = serde_json::to_vec(&manifest).map_err(ocisync_registry::RegistryError::from)?;
    let mut descriptor = Descriptor::from_bytes(MediaType::new(MediaType::OCI_MANIFEST), &data);
    descriptor.artifact_type = manifest.artifact_type;
    descriptor.annotations = manifest.annotations;

    store.push(&descriptor, data)?;
    store.tag(&descriptor, &descriptor.digest)?;

    tracing::debug!(
        digest = %descriptor.digest,
        layers = manifest.layers.len(),
        "Packed manifest"
    );
    Ok(descriptor)
}

//! Local files and directories exposed as content.
//!
//! Regular files are hashed in place and streamed from disk on fetch.
//! Directories are packed into a gzip tarball held in memory and marked with
//! the unpack annotation so a puller can restore them.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, ErrorKind, Read};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::error::RegistryError;
use crate::oci::{Descriptor, MediaType, ANNOTATION_TITLE, ANNOTATION_UNPACK};
use crate::target::{BlobReader, ReadOnlyTarget};

#[derive(Debug, Clone)]
enum Entry {
    File(PathBuf),
    Packed(Vec<u8>),
}

/// Content source over named local files and directories.
#[derive(Debug, Default)]
pub struct FileStore {
    entries: RwLock<HashMap<String, Entry>>,
    names: RwLock<HashMap<String, Descriptor>>,
}

impl FileStore {
    /// Creates an empty file store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `path` under `name` and returns its descriptor.
    ///
    /// An empty `media_type` selects the default: a tar layer for files and a
    /// gzip tar layer for directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is already taken or the path cannot be
    /// read or packed.
    pub fn add(
        &self,
        name: &str,
        media_type: &str,
        path: &Path,
    ) -> Result<Descriptor, RegistryError> {
        if self.names.read().contains_key(name) {
            return Err(RegistryError::DuplicateName {
                name: name.to_string(),
            });
        }

        let metadata = std::fs::metadata(path).map_err(|e| RegistryError::io(path, e))?;

        let (descriptor, entry) = if metadata.is_dir() {
            let packed = pack_directory(name, path)?;
            let media_type = non_empty_or(media_type, MediaType::OCI_LAYER_TAR_GZIP);
            let descriptor = Descriptor::from_bytes(MediaType::new(media_type), &packed)
                .with_annotation(ANNOTATION_UNPACK, "true");
            (descriptor, Entry::Packed(packed))
        } else {
            let (digest, size) = hash_file(path)?;
            let media_type = non_empty_or(media_type, MediaType::OCI_LAYER_TAR);
            let descriptor = Descriptor::new(MediaType::new(media_type), digest, size);
            (descriptor, Entry::File(path.to_path_buf()))
        };
        let descriptor = descriptor.with_annotation(ANNOTATION_TITLE, name);

        self.entries
            .write()
            .insert(descriptor.digest.clone(), entry);
        self.names
            .write()
            .insert(name.to_string(), descriptor.clone());

        tracing::debug!(name, digest = %descriptor.digest, size = descriptor.size, "Added file");
        Ok(descriptor)
    }
}

fn non_empty_or<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() {
        default
    } else {
        value
    }
}

fn hash_file(path: &Path) -> Result<(String, u64), RegistryError> {
    let mut file = File::open(path).map_err(|e| RegistryError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let read = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(RegistryError::io(path, e)),
        };
        hasher.update(&buf[..read]);
        size += read as u64;
    }

    Ok((format!("sha256:{}", hex::encode(hasher.finalize())), size))
}

/// Archive entries live under the relative form of `name`.
fn archive_prefix(name: &str) -> PathBuf {
    let prefix: PathBuf = Path::new(name)
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    if prefix.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        prefix
    }
}

fn pack_directory(name: &str, path: &Path) -> Result<Vec<u8>, RegistryError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(archive_prefix(name), path)
        .map_err(|e| RegistryError::io(path, e))?;
    let encoder = builder
        .into_inner()
        .map_err(|e| RegistryError::io(path, e))?;
    encoder.finish().map_err(|e| RegistryError::io(path, e))
}

#[async_trait]
impl ReadOnlyTarget for FileStore {
    async fn resolve(&self, reference: &str) -> Result<Descriptor, RegistryError> {
        self.names
            .read()
            .get(reference)
            .cloned()
            .ok_or_else(|| RegistryError::not_found(reference))
    }

    async fn fetch(&self, descriptor: &Descriptor) -> Result<BlobReader, RegistryError> {
        let entry = self
            .entries
            .read()
            .get(&descriptor.digest)
            .cloned()
            .ok_or_else(|| RegistryError::not_found(&descriptor.digest))?;

        match entry {
            Entry::File(path) => match tokio::fs::File::open(&path).await {
                Ok(file) => Ok(Box::new(file)),
                Err(e) => Err(RegistryError::io(path, e)),
            },
            Entry::Packed(data) => Ok(Box::new(Cursor::new(data))),
        }
    }

    async fn exists(&self, descriptor: &Descriptor) -> Result<bool, RegistryError> {
        Ok(self.entries.read().contains_key(&descriptor.digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::compute_digest;
    use crate::target::read_all;
    use flate2::read::GzDecoder;

    #[tokio::test]
    async fn test_add_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.xml");
        std::fs::write(&path, b"<testsuite/>").unwrap();

        let store = FileStore::new();
        let desc = store.add("report.xml", "", &path).unwrap();

        assert_eq!(desc.media_type.as_str(), MediaType::OCI_LAYER_TAR);
        assert_eq!(desc.digest, compute_digest(b"<testsuite/>"));
        assert_eq!(desc.size, 12);
        assert_eq!(desc.title(), Some("report.xml"));
        assert_eq!(store.resolve("report.xml").await.unwrap(), desc);
        assert_eq!(read_all(&store, &desc).await.unwrap(), b"<testsuite/>");
    }

    #[tokio::test]
    async fn test_add_directory_packs_tarball() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(logs.join("a.log"), b"alpha").unwrap();

        let store = FileStore::new();
        let desc = store.add("logs", "", &logs).unwrap();

        assert_eq!(desc.media_type.as_str(), MediaType::OCI_LAYER_TAR_GZIP);
        assert_eq!(desc.annotations.get(ANNOTATION_UNPACK).map(String::as_str), Some("true"));

        let packed = read_all(&store, &desc).await.unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(packed.as_slice()));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n == "logs/a.log"));
    }

    #[test]
    fn test_archive_prefix_is_relative() {
        assert_eq!(archive_prefix("/tmp/out/logs"), PathBuf::from("tmp/out/logs"));
        assert_eq!(archive_prefix("../logs"), PathBuf::from("logs"));
        assert_eq!(archive_prefix("/"), PathBuf::from("."));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"a").unwrap();

        let store = FileStore::new();
        store.add("a.txt", "text/plain", &path).unwrap();
        let err = store.add("a.txt", "text/plain", &path).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName { .. }));
    }

    #[test]
    fn test_missing_path_is_io_error() {
        let store = FileStore::new();
        let err = store
            .add("missing", "", Path::new("/definitely/not/here"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::IoError { .. }));
    }
}

//! On-disk content-addressable cache.
//!
//! The store uses the OCI image layout: an `oci-layout` marker, an
//! `index.json` recording tagged manifests, and one file per digest under
//! `blobs/<algorithm>/<hex>`. Blobs are verified before they are committed
//! and are written through a temporary file in `ingest/` that is renamed
//! into place, so a blob path only ever holds complete content that hashes
//! to its name.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::error::RegistryError;
use crate::oci::{parse_digest, verify_content, Descriptor, Index, ANNOTATION_REF_NAME};
use crate::target::{BlobReader, ReadOnlyTarget};

const BLOBS_DIR: &str = "blobs";
const INGEST_DIR: &str = "ingest";
const INDEX_FILE: &str = "index.json";
const LAYOUT_FILE: &str = "oci-layout";
const LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// Content-addressable blob cache backed by a directory.
#[derive(Debug)]
pub struct ContentStore {
    root: PathBuf,
    index_lock: Mutex<()>,
}

impl ContentStore {
    /// Opens (creating if necessary) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the layout directories cannot be created.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use ocisync_registry::ContentStore;
    ///
    /// let store = ContentStore::open("/tmp/ocisync-cache")?;
    /// # Ok::<(), ocisync_registry::RegistryError>(())
    /// ```
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let root = root.into();

        for dir in [root.join(BLOBS_DIR), root.join(INGEST_DIR)] {
            std::fs::create_dir_all(&dir).map_err(|e| RegistryError::io(&dir, e))?;
        }

        let layout = root.join(LAYOUT_FILE);
        if !layout.exists() {
            std::fs::write(&layout, LAYOUT_CONTENT).map_err(|e| RegistryError::io(&layout, e))?;
        }

        let store = Self {
            root,
            index_lock: Mutex::new(()),
        };

        if !store.index_path().exists() {
            store.write_index(&Index::default())?;
        }

        Ok(store)
    }

    /// Returns the store root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path a digest is stored under.
    ///
    /// # Errors
    ///
    /// Returns an error if the digest is malformed.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf, RegistryError> {
        let (algorithm, encoded) = parse_digest(digest)?;
        Ok(self.root.join(BLOBS_DIR).join(algorithm).join(encoded))
    }

    /// Returns true if content for the digest is present.
    ///
    /// # Errors
    ///
    /// Returns an error if the digest is malformed.
    pub fn contains(&self, digest: &str) -> Result<bool, RegistryError> {
        Ok(self.blob_path(digest)?.is_file())
    }

    /// Stores content under its descriptor's digest.
    ///
    /// Returns `true` if the blob was written and `false` if it was already
    /// present.
    ///
    /// # Errors
    ///
    /// Returns an error if the content does not match the descriptor or the
    /// blob cannot be written.
    pub fn put(&self, descriptor: &Descriptor, data: &[u8]) -> Result<bool, RegistryError> {
        verify_content(descriptor, data)?;

        let path = self.blob_path(&descriptor.digest)?;
        if path.is_file() {
            tracing::debug!(digest = %descriptor.digest, "Blob already cached");
            return Ok(false);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RegistryError::io(parent, e))?;
        }

        self.write_atomic(&path, data)?;
        tracing::debug!(digest = %descriptor.digest, size = descriptor.size, "Cached blob");
        Ok(true)
    }

    /// Reads and verifies the content for a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if absent, or a mismatch error if
    /// the stored bytes do not hash to the digest.
    pub fn get(&self, descriptor: &Descriptor) -> Result<Vec<u8>, RegistryError> {
        let path = self.blob_path(&descriptor.digest)?;
        let data = std::fs::read(&path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                RegistryError::not_found(&descriptor.digest)
            } else {
                RegistryError::io(&path, e)
            }
        })?;
        verify_content(descriptor, &data)?;
        Ok(data)
    }

    /// Records `reference` as a name for a cached manifest in `index.json`.
    ///
    /// An existing entry with the same name is replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read or written.
    pub fn tag(&self, descriptor: &Descriptor, reference: &str) -> Result<(), RegistryError> {
        let _guard = self.index_lock.lock();

        let mut index = self.read_index()?;
        index
            .manifests
            .retain(|entry| entry.annotations.get(ANNOTATION_REF_NAME).map(String::as_str) != Some(reference));
        index.manifests.push(
            descriptor
                .clone()
                .with_annotation(ANNOTATION_REF_NAME, reference),
        );

        self.write_index(&index)?;
        tracing::debug!(reference, digest = %descriptor.digest, "Tagged manifest in cache");
        Ok(())
    }

    /// Returns every tagged reference recorded in the index.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read.
    pub fn references(&self) -> Result<Vec<(String, Descriptor)>, RegistryError> {
        let index = self.read_index()?;
        Ok(index
            .manifests
            .into_iter()
            .filter_map(|entry| {
                let name = entry.annotations.get(ANNOTATION_REF_NAME)?.clone();
                Some((name, strip_ref_name(entry)))
            })
            .collect())
    }

    fn resolve_local(&self, reference: &str) -> Result<Descriptor, RegistryError> {
        let index = self.read_index()?;
        let by_digest = parse_digest(reference).is_ok();

        index
            .manifests
            .into_iter()
            .find(|entry| {
                if by_digest {
                    entry.digest == reference
                } else {
                    entry.annotations.get(ANNOTATION_REF_NAME).map(String::as_str) == Some(reference)
                }
            })
            .map(strip_ref_name)
            .ok_or_else(|| RegistryError::not_found(reference))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn read_index(&self) -> Result<Index, RegistryError> {
        let path = self.index_path();
        match std::fs::read(&path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Index::default()),
            Err(e) => Err(RegistryError::io(path, e)),
        }
    }

    fn write_index(&self, index: &Index) -> Result<(), RegistryError> {
        let data = serde_json::to_vec_pretty(index)?;
        self.write_atomic(&self.index_path(), &data)
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), RegistryError> {
        let ingest = self.root.join(INGEST_DIR);
        let mut tmp = NamedTempFile::new_in(&ingest).map_err(|e| RegistryError::io(&ingest, e))?;
        tmp.write_all(data)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| RegistryError::io(tmp.path(), e))?;
        tmp.persist(path)
            .map_err(|e| RegistryError::io(path, e.error))?;
        Ok(())
    }
}

fn strip_ref_name(mut descriptor: Descriptor) -> Descriptor {
    descriptor.annotations.remove(ANNOTATION_REF_NAME);
    descriptor
}

#[async_trait]
impl ReadOnlyTarget for ContentStore {
    async fn resolve(&self, reference: &str) -> Result<Descriptor, RegistryError> {
        self.resolve_local(reference)
    }

    async fn fetch(&self, descriptor: &Descriptor) -> Result<BlobReader, RegistryError> {
        let path = self.blob_path(&descriptor.digest)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(RegistryError::not_found(&descriptor.digest))
            }
            Err(e) => Err(RegistryError::io(path, e)),
        }
    }

    async fn exists(&self, descriptor: &Descriptor) -> Result<bool, RegistryError> {
        self.contains(&descriptor.digest)
    }
}

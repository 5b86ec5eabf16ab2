//! In-memory content store for freshly packed manifests.

use std::collections::HashMap;
use std::io::Cursor;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::RegistryError;
use crate::oci::{verify_content, Descriptor};
use crate::target::{BlobReader, ReadOnlyTarget};

/// Content store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<String, (Descriptor, Vec<u8>)>>,
    tags: RwLock<HashMap<String, Descriptor>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds verified content under its descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes do not match the descriptor.
    pub fn push(&self, descriptor: &Descriptor, data: Vec<u8>) -> Result<(), RegistryError> {
        verify_content(descriptor, &data)?;
        self.blobs
            .write()
            .insert(descriptor.digest.clone(), (descriptor.clone(), data));
        Ok(())
    }

    /// Binds a reference to a descriptor already in the store.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the content is absent.
    pub fn tag(&self, descriptor: &Descriptor, reference: &str) -> Result<(), RegistryError> {
        if !self.blobs.read().contains_key(&descriptor.digest) {
            return Err(RegistryError::not_found(&descriptor.digest));
        }
        self.tags
            .write()
            .insert(reference.to_string(), descriptor.clone());
        Ok(())
    }

    /// Returns the number of blobs held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Returns true if the store holds no blobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl ReadOnlyTarget for MemoryStore {
    async fn resolve(&self, reference: &str) -> Result<Descriptor, RegistryError> {
        self.tags
            .read()
            .get(reference)
            .cloned()
            .ok_or_else(|| RegistryError::not_found(reference))
    }

    async fn fetch(&self, descriptor: &Descriptor) -> Result<BlobReader, RegistryError> {
        let data = self
            .blobs
            .read()
            .get(&descriptor.digest)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| RegistryError::not_found(&descriptor.digest))?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn exists(&self, descriptor: &Descriptor) -> Result<bool, RegistryError> {
        Ok(self.blobs.read().contains_key(&descriptor.digest))
    }
}

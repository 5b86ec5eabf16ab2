//! Read-only content source capability.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::RegistryError;
use crate::oci::{verify_content, Descriptor};

/// Cap on the buffer reserved up front from an untrusted descriptor size.
const MAX_PREALLOCATION: usize = 64 * 1024 * 1024;

/// Byte stream returned by [`ReadOnlyTarget::fetch`].
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// A source that can resolve references and stream content by descriptor.
///
/// Implemented by the on-disk [`ContentStore`](crate::ContentStore), the
/// in-memory [`MemoryStore`](crate::MemoryStore), the local
/// [`FileStore`](crate::FileStore) and composed by
/// [`UnionTarget`](crate::UnionTarget).
#[async_trait]
pub trait ReadOnlyTarget: Send + Sync {
    /// Resolves a tag or digest reference to a descriptor.
    async fn resolve(&self, reference: &str) -> Result<Descriptor, RegistryError>;

    /// Opens the content addressed by a descriptor.
    async fn fetch(&self, descriptor: &Descriptor) -> Result<BlobReader, RegistryError>;

    /// Reports whether the content addressed by a descriptor is present.
    async fn exists(&self, descriptor: &Descriptor) -> Result<bool, RegistryError>;
}

/// Fetches a descriptor fully into memory and verifies it.
///
/// # Errors
///
/// Returns the fetch error, an I/O error while reading, or a digest/size
/// mismatch.
pub async fn read_all(
    target: &dyn ReadOnlyTarget,
    descriptor: &Descriptor,
) -> Result<Vec<u8>, RegistryError> {
    let mut reader = target.fetch(descriptor).await?;
    let capacity = usize::try_from(descriptor.size)
        .unwrap_or(0)
        .min(MAX_PREALLOCATION);
    let mut data = Vec::with_capacity(capacity);
    reader
        .read_to_end(&mut data)
        .await
        .map_err(|e| RegistryError::io(descriptor.digest.clone(), e))?;
    verify_content(descriptor, &data)?;
    Ok(data)
}

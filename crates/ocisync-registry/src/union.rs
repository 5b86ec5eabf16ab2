//! Read-only union over several content sources.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RegistryError;
use crate::oci::Descriptor;
use crate::target::{BlobReader, ReadOnlyTarget};

/// Answers lookups by trying member sources in priority order.
///
/// The first success wins. A "not found" from one member moves on to the
/// next; any other error is returned immediately without consulting the
/// remaining members. If every member reports "not found", so does the
/// union. The union never mutates its members.
#[derive(Clone, Default)]
pub struct UnionTarget {
    targets: Vec<Arc<dyn ReadOnlyTarget>>,
}

impl UnionTarget {
    /// Composes the given sources, highest priority first.
    #[must_use]
    pub fn new(targets: Vec<Arc<dyn ReadOnlyTarget>>) -> Self {
        Self { targets }
    }

    /// Returns the number of member sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Returns true if the union has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl std::fmt::Debug for UnionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnionTarget")
            .field("targets", &self.targets.len())
            .finish()
    }
}

#[async_trait]
impl ReadOnlyTarget for UnionTarget {
    async fn resolve(&self, reference: &str) -> Result<Descriptor, RegistryError> {
        let mut last_err = RegistryError::not_found(reference);
        for target in &self.targets {
            match target.resolve(reference).await {
                Ok(descriptor) => return Ok(descriptor),
                Err(e) if e.is_not_found() => last_err = e,
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    async fn fetch(&self, descriptor: &Descriptor) -> Result<BlobReader, RegistryError> {
        let mut last_err = RegistryError::not_found(&descriptor.digest);
        for target in &self.targets {
            match target.fetch(descriptor).await {
                Ok(reader) => return Ok(reader),
                Err(e) if e.is_not_found() => last_err = e,
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    async fn exists(&self, _descriptor: &Descriptor) -> Result<bool, RegistryError> {
        Err(RegistryError::NotImplemented {
            operation: "UnionTarget::exists".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::oci::MediaType;
    use crate::target::read_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Source that always fails with a fixed error and counts calls.
    #[derive(Default)]
    struct FailingTarget {
        hard: bool,
        calls: AtomicUsize,
    }

    impl FailingTarget {
        fn error(&self, what: &str) -> RegistryError {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hard {
                RegistryError::io(
                    "/broken",
                    std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
                )
            } else {
                RegistryError::not_found(what)
            }
        }
    }

    #[async_trait]
    impl ReadOnlyTarget for FailingTarget {
        async fn resolve(&self, reference: &str) -> Result<Descriptor, RegistryError> {
            Err(self.error(reference))
        }

        async fn fetch(&self, descriptor: &Descriptor) -> Result<BlobReader, RegistryError> {
            Err(self.error(&descriptor.digest))
        }

        async fn exists(&self, _descriptor: &Descriptor) -> Result<bool, RegistryError> {
            Ok(false)
        }
    }

    fn tagged_store(reference: &str, data: &[u8]) -> (Arc<MemoryStore>, Descriptor) {
        let store = MemoryStore::new();
        let desc = Descriptor::from_bytes(MediaType::new(MediaType::OCI_MANIFEST), data);
        store.push(&desc, data.to_vec()).unwrap();
        store.tag(&desc, reference).unwrap();
        (Arc::new(store), desc)
    }

    #[tokio::test]
    async fn test_resolve_falls_through_not_found() {
        let (second, expected) = tagged_store("v1", b"{\"x\":1}");
        let union = UnionTarget::new(vec![Arc::new(FailingTarget::default()), second]);

        assert_eq!(union.resolve("v1").await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_resolve_all_not_found() {
        let union = UnionTarget::new(vec![
            Arc::new(FailingTarget::default()),
            Arc::new(MemoryStore::new()),
        ]);

        assert!(union.resolve("v1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_resolve_hard_error_stops_search() {
        let (second, _) = tagged_store("v1", b"{\"x\":1}");
        let first = Arc::new(FailingTarget {
            hard: true,
            ..FailingTarget::default()
        });
        let union = UnionTarget::new(vec![first.clone(), second]);

        let err = union.resolve("v1").await.unwrap_err();
        assert!(matches!(err, RegistryError::IoError { .. }));
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_prefers_first_member() {
        let (first, desc) = tagged_store("a", b"{\"x\":1}");
        let (second, _) = tagged_store("b", b"{\"x\":1}");
        let union = UnionTarget::new(vec![first, second]);

        assert_eq!(read_all(&union, &desc).await.unwrap(), b"{\"x\":1}");
    }

    #[tokio::test]
    async fn test_fetch_hard_error_is_surfaced() {
        let (second, desc) = tagged_store("a", b"{}");
        let union = UnionTarget::new(vec![
            Arc::new(FailingTarget {
                hard: true,
                ..FailingTarget::default()
            }),
            second,
        ]);

        assert!(matches!(
            union.fetch(&desc).await,
            Err(RegistryError::IoError { .. })
        ));
    }

    #[tokio::test]
    async fn test_exists_not_implemented() {
        let union = UnionTarget::new(vec![Arc::new(MemoryStore::new())]);
        let desc = Descriptor::empty_config();

        assert!(matches!(
            union.exists(&desc).await,
            Err(RegistryError::NotImplemented { .. })
        ));
    }
}

//! Integration tests driving the sync controller against the mock registry.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ocisync_controller::{
    parse_duration, CacheGuard, ControllerError, SyncConfig, SyncController, UploadRequest,
};
use ocisync_registry::{Reference, Repository};
use ocisync_test::{hours_ago, ArtifactBuilder, MockRegistry};
use tempfile::TempDir;

fn repo(name: &str) -> Repository {
    Repository::new("quay.io", format!("ns/{name}"))
}

fn controller(dir: &TempDir, registry: Arc<MockRegistry>, concurrency: usize) -> SyncController {
    let config = SyncConfig::builder()
        .cache_dir(dir.path().join("cache"))
        .output_dir(dir.path().join("out"))
        .concurrency(concurrency)
        .window(parse_duration("2d").unwrap())
        .build()
        .unwrap();
    SyncController::new(config, registry).unwrap()
}

fn cached_references(controller: &SyncController) -> BTreeSet<String> {
    controller
        .store()
        .references()
        .unwrap()
        .into_iter()
        .map(|(name, _)| name)
        .collect()
}

fn blob_files(cache: &Path) -> BTreeSet<String> {
    std::fs::read_dir(cache.join("blobs/sha256"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

// =============================================================================
// Batch Processing Tests
// =============================================================================

#[tokio::test]
async fn test_partial_failure_is_isolated() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MockRegistry::new());
    for name in ["a", "b", "c"] {
        ArtifactBuilder::new()
            .with_file(&format!("{name}.txt"), name.as_bytes())
            .publish(&registry, &repo(name), "v1", hours_ago(1));
    }
    registry.fail_list_tags(&repo("b"));

    let controller = controller(&dir, registry, 10);
    let errors = controller
        .process_repositories(&[repo("a"), repo("b"), repo("c")])
        .await;

    assert_eq!(errors.len(), 1, "errors: {errors:?}");
    assert_eq!(errors[0].repository(), Some("quay.io/ns/b"));
    assert!(errors[0].to_string().starts_with("repository quay.io/ns/b:"));

    assert_eq!(
        cached_references(&controller),
        BTreeSet::from(["quay.io/ns/a:v1".to_string(), "quay.io/ns/c:v1".to_string()])
    );
    assert!(dir.path().join("out/quay.io/ns/a/v1/a.txt").is_file());
    assert!(dir.path().join("out/quay.io/ns/c/v1/c.txt").is_file());
}

#[tokio::test]
async fn test_second_run_copies_nothing() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MockRegistry::new());
    ArtifactBuilder::new()
        .with_file("junit.xml", b"<testsuite/>")
        .with_directory("logs", &[("a.log", b"alpha".as_slice())])
        .publish(&registry, &repo("app"), "v1", hours_ago(3));

    let controller = controller(&dir, Arc::clone(&registry), 10);
    assert!(controller.process_repositories(&[repo("app")]).await.is_empty());
    let fetches = registry.blob_fetches();
    let blobs = blob_files(&dir.path().join("cache"));
    let references = cached_references(&controller);

    assert!(controller.process_repositories(&[repo("app")]).await.is_empty());
    assert_eq!(registry.blob_fetches(), fetches);
    assert_eq!(blob_files(&dir.path().join("cache")), blobs);
    assert_eq!(cached_references(&controller), references);

    let report = controller
        .process_tag(&repo("app"), "v1", Utc::now())
        .await
        .unwrap();
    assert_eq!(report.copied, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_never_exceeds_limit() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MockRegistry::new().with_delay(Duration::from_millis(10)));
    let repositories: Vec<Repository> = (0..30).map(|i| repo(&format!("r{i}"))).collect();
    for (i, repository) in repositories.iter().enumerate() {
        ArtifactBuilder::new()
            .with_file("data.bin", format!("payload-{i}").as_bytes())
            .publish(&registry, repository, "v1", hours_ago(1));
    }

    let controller = controller(&dir, Arc::clone(&registry), 3);
    let errors = controller.process_repositories(&repositories).await;

    assert!(errors.is_empty(), "errors: {errors:?}");
    let admission = controller.scheduler().admission();
    assert!(admission.peak() <= 3, "admission peak {}", admission.peak());
    assert!(admission.peak() >= 1);
    assert_eq!(admission.active(), 0);
    assert!(registry.peak_in_flight() <= 3, "registry peak {}", registry.peak_in_flight());
    assert_eq!(cached_references(&controller).len(), 30);
}

#[tokio::test]
async fn test_old_tags_are_ignored() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MockRegistry::new());
    ArtifactBuilder::new()
        .with_file("stale.txt", b"stale")
        .publish(&registry, &repo("app"), "stale", hours_ago(49));
    ArtifactBuilder::new()
        .with_file("fresh.txt", b"fresh")
        .publish(&registry, &repo("app"), "fresh", hours_ago(47));

    let controller = controller(&dir, registry, 10);
    assert!(controller.process_repositories(&[repo("app")]).await.is_empty());

    assert_eq!(
        cached_references(&controller),
        BTreeSet::from(["quay.io/ns/app:fresh".to_string()])
    );
}

#[tokio::test]
async fn test_cancelled_batch_reports_every_repository() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MockRegistry::new());
    let repositories = [repo("a"), repo("b"), repo("c")];
    for repository in &repositories {
        ArtifactBuilder::new()
            .with_file("x.txt", b"x")
            .publish(&registry, repository, "v1", hours_ago(1));
    }

    let controller = controller(&dir, registry, 2);
    controller.cancellation_token().cancel();
    let errors = controller.process_repositories(&repositories).await;

    assert_eq!(errors.len(), 3);
    assert!(errors.iter().all(ControllerError::is_cancelled));
    assert!(cached_references(&controller).is_empty());
}

// =============================================================================
// Upload Tests
// =============================================================================

#[tokio::test]
async fn test_upload_round_trip() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MockRegistry::new());
    let source = Reference::parse("quay.io/ns/app:v1").unwrap();
    ArtifactBuilder::new()
        .with_directory("reports", &[("junit.xml", b"<testsuite/>".as_slice())])
        .with_annotation("org.opencontainers.image.version", "1.4.0")
        .publish(&registry, &source.repository, "v1", hours_ago(1));

    let notes = dir.path().join("notes.txt");
    std::fs::write(&notes, b"triaged").unwrap();

    let controller = controller(&dir, Arc::clone(&registry), 10);
    let destination = Reference::parse("quay.io/ns/archive:app-v1").unwrap();
    let request = UploadRequest::new(destination.clone())
        .with_file(notes.to_string_lossy())
        .with_annotations_from(source)
        .with_source_content(true);
    let uploaded = controller.upload(&request).await.unwrap();

    assert_eq!(
        uploaded.manifest.annotations["org.opencontainers.image.version"],
        "1.4.0"
    );

    // Pull the new artifact back through the regular download path.
    let report = controller
        .process_tag(&destination.repository, &destination.tag, Utc::now())
        .await
        .unwrap();
    assert_eq!(report.manifest.digest, uploaded.manifest.digest);

    // Absolute inputs are exported below the tag directory, not dropped.
    let relative: PathBuf = notes
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    let exported = controller
        .config()
        .output_dir
        .join("quay.io/ns/archive/app-v1")
        .join(relative);
    assert_eq!(std::fs::read(exported).unwrap(), b"triaged");

    let annotations = controller
        .fetch_annotations(&destination.repository, &destination.tag)
        .await
        .unwrap();
    assert_eq!(annotations.annotations["org.opencontainers.image.version"], "1.4.0");
    assert_eq!(
        annotations.artifact_type.as_deref(),
        Some("application/vnd.unknown.artifact.v1")
    );
}

#[tokio::test]
async fn test_upload_second_push_skips_existing_blobs() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MockRegistry::new());
    let file = dir.path().join("data.bin");
    std::fs::write(&file, b"payload").unwrap();

    let controller = controller(&dir, Arc::clone(&registry), 10);
    let request = UploadRequest::new(Reference::parse("quay.io/ns/out:latest").unwrap())
        .with_file(file.to_string_lossy());

    let first = controller.upload(&request).await.unwrap();
    assert_eq!(first.skipped, 0);

    let second = controller.upload(&request).await.unwrap();
    assert_eq!(second.skipped, 2);
    assert_eq!(second.pushed, 1);
    assert_eq!(registry.blob_pushes(), 2);
}

// =============================================================================
// Cache Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_cache_removed_after_failed_batch() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MockRegistry::new());
    ArtifactBuilder::new()
        .with_file("a.txt", b"a")
        .publish(&registry, &repo("ok"), "v1", hours_ago(1));
    registry.fail_list_tags(&repo("broken"));

    let cache = dir.path().join("cache");
    {
        let _guard = CacheGuard::new(&cache, true);
        let controller = controller(&dir, registry, 10);
        let errors = controller
            .process_repositories(&[repo("ok"), repo("broken")])
            .await;
        assert_eq!(errors.len(), 1);
        assert!(cache.join("index.json").is_file());
    }

    assert!(!cache.exists());
    assert!(dir.path().join("out/quay.io/ns/ok/v1/a.txt").is_file());
}

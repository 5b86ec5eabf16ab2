//! Upload command implementation.
//!
//! Packs local files and folders into an OCI artifact and pushes it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use ocisync_controller::{default_cache_dir, SyncConfig, SyncController, UploadRequest};
use ocisync_registry::Reference;
use tokio_util::sync::CancellationToken;

use super::RegistryArgs;

/// Usage examples shown after the help text.
pub const EXAMPLES: &str = "Examples:
  Upload multiple files:
    ocisync upload --dest quay.io/ns/repo:tag file1.tar file2.tar

  Upload both files and folders:
    ocisync upload --dest quay.io/ns/repo:tag file1.tar ./folder1

  Re-publish a tag's content with its annotations plus a summary:
    ocisync upload --dest quay.io/ns/archive:run-1 --annotations-from quay.io/ns/repo:run-1 \\
      --include-source summary.txt";

/// Arguments for the upload command.
#[derive(Args, Debug, Clone)]
pub struct UploadArgs {
    /// Destination repository and tag (e.g., quay.io/ns/repo:tag)
    #[arg(short = 'D', long)]
    pub dest: String,

    /// Set the artifact type for the upload
    #[arg(short = 'T', long)]
    pub artifact_type: Option<String>,

    /// Copy manifest annotations from this tag
    #[arg(long)]
    pub annotations_from: Option<String>,

    /// Also pack the downloaded content of --annotations-from
    #[arg(long, requires = "annotations_from")]
    pub include_source: bool,

    /// JSON file with per-file, `$manifest` and `$config` annotations
    #[arg(long)]
    pub annotation_file: Option<PathBuf>,

    /// Directory where OCI artifacts will be cached (default: $HOME/.config/ocisync/cache)
    #[arg(long, env = "OCISYNC_CACHE")]
    pub oci_cache: Option<PathBuf>,

    /// Where source content is exported before packing
    #[arg(long, default_value = "artifacts")]
    pub artifacts_output: PathBuf,

    /// Files and folders to upload, each as `path[:media-type]`
    pub files: Vec<String>,

    #[command(flatten)]
    pub registry: RegistryArgs,
}

impl UploadArgs {
    /// Builds and validates the upload request.
    pub fn request(&self) -> Result<UploadRequest> {
        let destination = Reference::parse(&self.dest).context("invalid --dest")?;

        let mut request = UploadRequest::new(destination).with_source_content(self.include_source);
        request.files.clone_from(&self.files);
        if let Some(artifact_type) = &self.artifact_type {
            request = request.with_artifact_type(artifact_type);
        }
        if let Some(source) = &self.annotations_from {
            let source = Reference::parse(source).context("invalid --annotations-from")?;
            request = request.with_annotations_from(source);
        }
        if let Some(path) = &self.annotation_file {
            request = request.with_annotation_file(path);
        }

        request.validate()?;
        Ok(request)
    }
}

/// Runs the upload command.
///
/// # Errors
///
/// Returns an error if:
/// - The destination or a file reference is invalid
/// - A file cannot be read
/// - The push fails
pub async fn run(args: &UploadArgs, cancel: CancellationToken) -> Result<()> {
    let request = args.request()?;
    let registry = args.registry.client()?;

    let cache_dir = match &args.oci_cache {
        Some(dir) => dir.clone(),
        None => default_cache_dir()?,
    };
    let config = SyncConfig::builder()
        .cache_dir(&cache_dir)
        .output_dir(&args.artifacts_output)
        .build()?;
    let controller = SyncController::new(config, registry)
        .with_context(|| format!("failed to open OCI cache at '{}'", cache_dir.display()))?
        .with_cancellation(cancel);

    let report = controller
        .upload(&request)
        .await
        .with_context(|| format!("failed to upload to {}", request.destination))?;

    println!(
        "Uploaded {} ({}) with artifact type {}: {} pushed, {} already present",
        request.destination,
        report.manifest.digest,
        report
            .manifest
            .artifact_type
            .as_deref()
            .unwrap_or_default(),
        report.pushed,
        report.skipped
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Cli, Commands};
    use clap::Parser;

    fn parse(args: &[&str]) -> Result<UploadArgs> {
        let cli = Cli::try_parse_from(std::iter::once("ocisync").chain(args.iter().copied()))?;
        match cli.command {
            Commands::Upload(args) => Ok(args),
            _ => anyhow::bail!("expected upload"),
        }
    }

    #[test]
    fn test_parse_upload_flags() {
        let args = parse(&[
            "upload",
            "-D",
            "quay.io/ns/repo:tag",
            "-T",
            "application/vnd.example",
            "a.txt",
            "logs:application/x-logs",
        ])
        .unwrap();

        let request = args.request().unwrap();
        assert_eq!(request.destination.tag, "tag");
        assert_eq!(request.artifact_type.as_deref(), Some("application/vnd.example"));
        assert_eq!(request.files, ["a.txt", "logs:application/x-logs"]);
    }

    #[test]
    fn test_dest_is_required() {
        assert!(parse(&["upload", "a.txt"]).is_err());
    }

    #[test]
    fn test_include_source_requires_annotation_source() {
        assert!(parse(&["upload", "--dest", "quay.io/ns/repo:tag", "--include-source"]).is_err());

        let args = parse(&[
            "upload",
            "--dest",
            "quay.io/ns/repo:tag",
            "--annotations-from",
            "quay.io/ns/src:v1",
            "--include-source",
        ])
        .unwrap();
        assert!(args.request().unwrap().include_source);
    }

    #[test]
    fn test_request_validation() {
        let no_files = parse(&["upload", "--dest", "quay.io/ns/repo:tag"]).unwrap();
        assert!(no_files.request().is_err());

        let bad_dest = parse(&["upload", "--dest", "ns/repo", "a.txt"]).unwrap();
        assert!(bad_dest.request().is_err());

        let empty_path = parse(&["upload", "--dest", "quay.io/ns/repo:tag", ":text/plain"]).unwrap();
        let err = empty_path.request().unwrap_err();
        assert_eq!(err.to_string(), "found empty file path in ':text/plain'");
    }
}

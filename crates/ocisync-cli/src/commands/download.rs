//! Download command implementation.
//!
//! Fetches a single tag, or every recent tag of a set of repositories, into
//! the local cache and the artifacts output directory.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use ocisync_controller::{
    default_cache_dir, parse_duration, CacheGuard, SyncConfig, SyncController,
};
use ocisync_registry::{Reference, Repository};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::RegistryArgs;

/// Usage examples shown after the help text.
pub const EXAMPLES: &str = "Examples:
  Download from a single repository:
    ocisync download --repo quay.io/test/test:1.0 --artifacts-output /path/to/output

  Download from multiple repositories within the last 2 days:
    ocisync download --repos quay.io/repo1 quay.io/repo2 --since 2d --artifacts-output /path/to/output";

/// Arguments for the download command.
#[derive(Args, Debug, Clone, Default)]
pub struct DownloadArgs {
    /// OCI repository and tag to download (e.g., quay.io/test/test:1.0)
    #[arg(long)]
    pub repo: Option<String>,

    /// Set of OCI repositories to download from (use with --since)
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    pub repos: Vec<String>,

    /// Time range to download the latest artifacts (e.g., 4h, 10m, 2d)
    #[arg(long)]
    pub since: Option<String>,

    /// Directory where OCI artifacts will be cached (default: $HOME/.config/ocisync/cache)
    #[arg(long, env = "OCISYNC_CACHE")]
    pub oci_cache: Option<PathBuf>,

    /// Mandatory path to store downloaded artifacts
    #[arg(long)]
    pub artifacts_output: Option<PathBuf>,

    /// Remove the OCI cache after downloading artifacts
    #[arg(long)]
    pub no_cache: bool,

    /// Maximum number of repositories processed at once
    #[arg(long, default_value = "10")]
    pub concurrency: usize,

    #[command(flatten)]
    pub registry: RegistryArgs,
}

/// What a validated download will do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Fetch one tag.
    Single(Reference),

    /// Fetch every tag modified within `window` from each repository.
    Batch {
        /// Repositories to process.
        repositories: Vec<Repository>,
        /// Time window.
        window: Duration,
    },
}

impl DownloadArgs {
    /// Checks flag combinations and parses every input.
    ///
    /// Runs before any network or disk activity.
    pub fn plan(&self) -> Result<(Plan, PathBuf)> {
        let since = self.since.as_deref().filter(|s| !s.is_empty());

        if self.repo.is_some() && !self.repos.is_empty() {
            anyhow::bail!("you cannot use both --repo and --repos at the same time");
        }
        if since.is_some() && self.repos.is_empty() {
            anyhow::bail!("the --since flag requires the --repos flag");
        }
        if !self.repos.is_empty() && since.is_none() {
            anyhow::bail!("the --repos flag requires the --since flag");
        }
        if self.repo.is_none() && self.repos.is_empty() {
            anyhow::bail!("either --repo or --repos must be specified");
        }
        let Some(output) = self.artifacts_output.clone() else {
            anyhow::bail!("the --artifacts-output flag is mandatory");
        };

        let plan = match (&self.repo, since) {
            (Some(repo), _) => Plan::Single(Reference::parse(repo)?),
            (None, Some(since)) => Plan::Batch {
                repositories: self
                    .repos
                    .iter()
                    .map(|r| Repository::parse(r))
                    .collect::<std::result::Result<Vec<_>, _>>()?,
                window: parse_duration(since).context("invalid time format for --since")?,
            },
            (None, None) => anyhow::bail!("either --repo or --repos must be specified"),
        };
        Ok((plan, output))
    }
}

/// Runs the download command.
///
/// Failures of individual repositories in a batch are logged and do not
/// fail the command; a failed single-tag download does.
///
/// # Errors
///
/// Returns an error if:
/// - The flags are invalid
/// - The cache cannot be opened
/// - A single-tag download fails
pub async fn run(args: &DownloadArgs, cancel: CancellationToken) -> Result<()> {
    let (plan, output) = args.plan()?;
    let registry = args.registry.client()?;

    let cache_dir = match &args.oci_cache {
        Some(dir) => dir.clone(),
        None => default_cache_dir()?,
    };
    let mut builder = SyncConfig::builder()
        .cache_dir(&cache_dir)
        .output_dir(&output)
        .concurrency(args.concurrency)
        .remove_cache(args.no_cache);
    if let Plan::Batch { window, .. } = &plan {
        builder = builder.window(*window);
    }
    let config = builder.build()?;

    let _cache = CacheGuard::new(&config.cache_dir, config.remove_cache);
    let controller = SyncController::new(config, registry)
        .with_context(|| format!("failed to open OCI cache at '{}'", cache_dir.display()))?
        .with_cancellation(cancel);

    match plan {
        Plan::Single(reference) => {
            let report = controller
                .process_tag(&reference.repository, &reference.tag, Utc::now())
                .await
                .with_context(|| format!("failed to fetch tag {reference}"))?;
            println!(
                "Downloaded {reference} ({}): {} blob(s) copied, {} already cached",
                report.manifest.digest, report.copied, report.skipped
            );
        }
        Plan::Batch { repositories, window } => {
            info!(
                repositories = repositories.len(),
                window_secs = window.as_secs(),
                "Downloading latest artifacts"
            );
            let errors = controller.process_repositories(&repositories).await;
            if errors.is_empty() {
                println!("Processed {} repositories", repositories.len());
            } else {
                println!(
                    "Processed {} repositories, {} failed:",
                    repositories.len(),
                    errors.len()
                );
                for error in &errors {
                    println!(" - {error}");
                }
            }
        }
    }

    Ok(())
}

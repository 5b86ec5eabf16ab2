//! Configuration types for the sync controller.
//!
//! A [`SyncConfig`] is built once per invocation and shared immutably by every
//! orchestration call.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ControllerError, Result};
use crate::scheduler::SchedulerConfig;

/// Application directory name under `$HOME/.config`.
const APP_DIR: &str = "ocisync";

/// Largest accepted concurrency limit.
pub const MAX_CONCURRENCY: usize = 1024;

/// Returns the default cache location, `$HOME/.config/ocisync/cache`.
///
/// # Errors
///
/// Returns a validation error if the home directory cannot be determined.
pub fn default_cache_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_DIR).join("cache"))
        .ok_or_else(|| ControllerError::validation("could not determine home directory"))
}

/// Configuration for the sync controller.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Root of the content-addressable cache.
    pub cache_dir: PathBuf,

    /// Directory receiving exported, human-facing artifacts.
    pub output_dir: PathBuf,

    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,

    /// Only tags modified within this window are processed during batch runs.
    pub window: Option<Duration>,

    /// Remove the cache directory once the run completes.
    pub remove_cache: bool,
}

impl SyncConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Maximum number of repositories processed concurrently.
    #[must_use]
    pub const fn concurrency(&self) -> usize {
        self.scheduler.max_concurrent
    }
}

/// Builder for [`SyncConfig`].
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    cache_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    concurrency: Option<usize>,
    window: Option<Duration>,
    remove_cache: bool,
}

impl SyncConfigBuilder {
    /// Sets the cache directory. Defaults to [`default_cache_dir`].
    #[must_use]
    pub fn cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    /// Sets the output directory. Defaults to `./artifacts`.
    #[must_use]
    pub fn output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(path.into());
        self
    }

    /// Sets the concurrency limit. Defaults to 10.
    #[must_use]
    pub const fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    /// Restricts batch runs to tags modified within `window`.
    #[must_use]
    pub const fn window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    /// Enables or disables cache removal after the run.
    #[must_use]
    pub const fn remove_cache(mut self, remove: bool) -> Self {
        self.remove_cache = remove;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the concurrency limit is zero or no
    /// cache directory was given and the home directory is unknown.
    pub fn build(self) -> Result<SyncConfig> {
        let defaults = SchedulerConfig::default();
        let concurrency = self.concurrency.unwrap_or(defaults.max_concurrent);
        if concurrency == 0 {
            return Err(ControllerError::validation(
                "concurrency limit must be at least 1",
            ));
        }
        if concurrency > MAX_CONCURRENCY {
            return Err(ControllerError::validation(format!(
                "concurrency limit must be at most {MAX_CONCURRENCY}"
            )));
        }

        let cache_dir = match self.cache_dir {
            Some(dir) => dir,
            None => default_cache_dir()?,
        };

        Ok(SyncConfig {
            cache_dir,
            output_dir: self
                .output_dir
                .unwrap_or_else(|| PathBuf::from("artifacts")),
            scheduler: SchedulerConfig::builder().max_concurrent(concurrency).build(),
            window: self.window,
            remove_cache: self.remove_cache,
        })
    }
}

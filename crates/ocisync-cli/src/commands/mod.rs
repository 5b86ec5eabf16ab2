//! CLI commands and argument parsing.

pub mod download;
pub mod upload;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ocisync_registry::{Registry, RegistryAuth, RegistryClient, RegistryConfig, TlsConfig};

/// ocisync - Sync OCI artifacts between registries and a local cache
#[derive(Parser)]
#[command(name = "ocisync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Download artifacts from OCI storage
    #[command(after_help = download::EXAMPLES)]
    Download(download::DownloadArgs),

    /// Upload files and folders to OCI storage
    #[command(after_help = upload::EXAMPLES)]
    Upload(upload::UploadArgs),

    /// Print version information
    Version,
}

/// Registry connection flags shared by every command.
#[derive(Args, Debug, Clone, Default)]
pub struct RegistryArgs {
    /// Bearer token for authentication
    #[arg(long, env = "OCISYNC_REGISTRY_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Username for basic authentication
    #[arg(long, env = "OCISYNC_REGISTRY_USERNAME")]
    pub username: Option<String>,

    /// Password for basic authentication
    #[arg(long, env = "OCISYNC_REGISTRY_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    pub timeout: u64,

    /// Use plain HTTP instead of HTTPS
    #[arg(long)]
    pub plain_http: bool,

    /// Extra PEM CA certificate to trust (repeatable)
    #[arg(long, env = "OCISYNC_CA_CERT", value_delimiter = ',')]
    pub ca_cert: Vec<PathBuf>,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure: bool,
}

impl RegistryArgs {
    /// Determines the authentication method from the flags.
    pub fn auth(&self) -> Result<RegistryAuth> {
        if let Some(ref token) = self.token {
            return Ok(RegistryAuth::bearer(token));
        }

        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            return Ok(RegistryAuth::basic(username, password));
        }

        if self.username.is_some() || self.password.is_some() {
            anyhow::bail!("Both --username and --password are required for basic authentication");
        }

        Ok(RegistryAuth::None)
    }

    /// Builds the client configuration from the flags.
    pub fn config(&self) -> Result<RegistryConfig> {
        let tls = self
            .ca_cert
            .iter()
            .fold(TlsConfig::default(), |tls, path| tls.with_ca_cert(path))
            .with_insecure(self.insecure);

        Ok(RegistryConfig::new()
            .with_auth(self.auth()?)
            .with_timeout(Duration::from_secs(self.timeout))
            .with_plain_http(self.plain_http)
            .with_tls(tls))
    }

    /// Builds a registry client from the flags.
    pub fn client(&self) -> Result<Arc<dyn Registry>> {
        let client =
            RegistryClient::new(self.config()?).context("Failed to create registry client")?;
        Ok(Arc::new(client))
    }
}

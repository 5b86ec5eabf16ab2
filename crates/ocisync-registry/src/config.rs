//! Configuration types for the registry client.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the registry client.
///
/// One client serves every registry host; the host is taken from the
/// [`Repository`](crate::Repository) of each call.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Authentication configuration.
    pub auth: RegistryAuth,

    /// Request timeout.
    pub timeout: Duration,

    /// Certificate trust settings.
    pub tls: TlsConfig,

    /// Talk plain HTTP instead of HTTPS.
    pub plain_http: bool,

    /// Retry policy for transient failures.
    pub retry: RetryPolicy,

    /// User agent string.
    pub user_agent: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryConfig {
    /// Creates a registry configuration with default settings.
    ///
    /// # Examples
    ///
    /// ```
    /// use ocisync_registry::RegistryConfig;
    ///
    /// let config = RegistryConfig::new();
    /// assert_eq!(config.base_url("quay.io"), "https://quay.io");
    /// ```
    #[must_use]
    pub fn new() -> Self {
        Self {
            auth: RegistryAuth::None,
            timeout: Duration::from_secs(30),
            tls: TlsConfig::default(),
            plain_http: false,
            retry: RetryPolicy::default(),
            user_agent: format!("ocisync/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Sets the authentication method.
    #[must_use]
    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = auth;
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the certificate trust settings.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Switches between plain HTTP and HTTPS.
    #[must_use]
    pub const fn with_plain_http(mut self, plain_http: bool) -> Self {
        self.plain_http = plain_http;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the base URL for a registry host.
    #[must_use]
    pub fn base_url(&self, registry: &str) -> String {
        let scheme = if self.plain_http { "http" } else { "https" };
        format!("{scheme}://{registry}")
    }
}

/// Static credentials sent with every registry request.
#[derive(Debug, Clone)]
pub enum RegistryAuth {
    /// No authentication (public repositories, local registries).
    None,

    /// Basic authentication (username/password or username/token).
    Basic {
        /// Username.
        username: String,
        /// Password or token.
        password: String,
    },

    /// Bearer token authentication.
    Bearer {
        /// Token value.
        token: String,
    },
}

impl RegistryAuth {
    /// Creates basic authentication.
    ///
    /// # Examples
    ///
    /// ```
    /// use ocisync_registry::RegistryAuth;
    ///
    /// let auth = RegistryAuth::basic("user", "pass");
    /// ```
    #[must_use]
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Creates bearer token authentication.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer {
            token: token.into(),
        }
    }
}

/// Bounded exponential backoff for transient registry failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub initial_backoff: Duration,

    /// Upper bound for any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based), doubling each time.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Trust settings for HTTPS registries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// Extra PEM root certificates, e.g. for a registry behind a private CA.
    pub ca_certs: Vec<PathBuf>,

    /// Accept any server certificate.
    pub insecure: bool,
}

impl TlsConfig {
    /// Trusts the PEM certificates in `path` in addition to the system roots.
    #[must_use]
    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_certs.push(path.into());
        self
    }

    /// Turns certificate verification off or on.
    #[must_use]
    pub const fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_new() {
        let config = RegistryConfig::new();
        assert!(matches!(config.auth, RegistryAuth::None));
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(config.user_agent.starts_with("ocisync/"));
    }

    #[test]
    fn test_base_url_scheme() {
        let config = RegistryConfig::new().with_plain_http(true);
        assert_eq!(config.base_url("localhost:5000"), "http://localhost:5000");
    }

    #[test]
    fn test_basic_auth() {
        let auth = RegistryAuth::basic("user", "pass");
        assert!(matches!(
            auth,
            RegistryAuth::Basic { username, password }
            if username == "user" && password == "pass"
        ));
    }

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(30), Duration::from_millis(350));
    }

    #[test]
    fn test_tls_config() {
        assert_eq!(RegistryConfig::new().tls, TlsConfig::default());

        let tls = TlsConfig::default()
            .with_ca_cert("/etc/ocisync/ca.pem")
            .with_ca_cert("/etc/ocisync/intermediate.pem");
        assert_eq!(tls.ca_certs.len(), 2);
        assert!(!tls.insecure);

        let config = RegistryConfig::new().with_tls(TlsConfig::default().with_insecure(true));
        assert!(config.tls.insecure);
    }
}

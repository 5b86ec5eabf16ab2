//! OCI Distribution API client.
//!
//! [`Registry`] is the remote capability the sync controller works against.
//! [`RegistryClient`] implements it over HTTP: manifests and blobs through the
//! `/v2/` distribution endpoints, tag listings through the Quay
//! `/api/v1/repository/<name>/tag/` API, which is the only listing that
//! carries per-tag modification times.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, LOCATION};
use reqwest::{RequestBuilder, Response, StatusCode};
use url::Url;

use crate::config::{RegistryAuth, RegistryConfig};
use crate::error::RegistryError;
use crate::oci::{verify_content, Descriptor, MediaType, Tag, TagPage};
use crate::reference::Repository;

/// Header carrying the canonical digest of a served manifest.
const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Manifest media types accepted from the registry, most preferred first.
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
    application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json, \
    application/vnd.docker.distribution.manifest.list.v2+json";

/// Remote registry operations used by the sync controller.
///
/// Implementations must be safe to share across concurrent workers.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Lists every active tag of a repository with its last-modified time.
    async fn list_tags(&self, repository: &Repository) -> Result<Vec<Tag>, RegistryError>;

    /// Fetches a manifest by tag or digest, returning its descriptor and bytes.
    async fn fetch_manifest(
        &self,
        repository: &Repository,
        reference: &str,
    ) -> Result<(Descriptor, Vec<u8>), RegistryError>;

    /// Fetches and verifies a blob.
    async fn fetch_blob(
        &self,
        repository: &Repository,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>, RegistryError>;

    /// Reports whether a blob is already present in the repository.
    async fn blob_exists(
        &self,
        repository: &Repository,
        descriptor: &Descriptor,
    ) -> Result<bool, RegistryError>;

    /// Uploads a blob.
    async fn push_blob(
        &self,
        repository: &Repository,
        descriptor: &Descriptor,
        data: Vec<u8>,
    ) -> Result<(), RegistryError>;

    /// Uploads a manifest and binds it to `reference`.
    async fn push_manifest(
        &self,
        repository: &Repository,
        reference: &str,
        descriptor: &Descriptor,
        data: Vec<u8>,
    ) -> Result<(), RegistryError>;
}

/// HTTP client for OCI-compatible registries.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    config: RegistryConfig,
    http: reqwest::Client,
}

impl RegistryClient {
    /// Creates a new registry client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created or a TLS file
    /// cannot be read.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use ocisync_registry::{RegistryClient, RegistryConfig};
    ///
    /// let client = RegistryClient::new(RegistryConfig::new())?;
    /// # Ok::<(), ocisync_registry::RegistryError>(())
    /// ```
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        let http = Self::build_http_client(&config)?;
        Ok(Self { config, http })
    }

    /// Returns the registry configuration.
    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn v2_url(&self, repository: &Repository, path: &str) -> String {
        format!(
            "{}/v2/{}/{path}",
            self.config.base_url(&repository.registry),
            repository.name
        )
    }

    fn tags_url(&self, repository: &Repository, page: u32) -> String {
        format!(
            "{}/api/v1/repository/{}/tag/?onlyActiveTags=true&page={page}",
            self.config.base_url(&repository.registry),
            repository.name
        )
    }

    /// Sends a request, retrying transient failures with backoff.
    ///
    /// `build` is invoked once per attempt. A response with a retryable
    /// status is returned as-is once the retry budget is spent.
    async fn send<F>(&self, build: F) -> Result<Response, RegistryError>
    where
        F: Fn() -> Result<RequestBuilder, RegistryError> + Send + Sync,
    {
        let policy = self.config.retry;
        let mut attempt = 0u32;

        loop {
            let outcome = build()?.send().await.map_err(RegistryError::from);
            let retryable = match &outcome {
                Ok(response) => is_retryable_status(response.status()),
                Err(e) => e.is_retryable(),
            };

            if !retryable || attempt >= policy.max_retries {
                return outcome;
            }

            attempt += 1;
            let delay = policy.backoff(attempt);
            match &outcome {
                Ok(response) => tracing::debug!(
                    status = response.status().as_u16(),
                    attempt,
                    delay_ms = delay.as_millis(),
                    "Retrying registry request"
                ),
                Err(e) => tracing::debug!(
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis(),
                    "Retrying registry request"
                ),
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// Builds the HTTP client with proper configuration.
    fn build_http_client(config: &RegistryConfig) -> Result<reqwest::Client, RegistryError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent);

        if config.tls.insecure {
            tracing::warn!("TLS certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        for path in &config.tls.ca_certs {
            let pem = std::fs::read(path).map_err(|e| RegistryError::io(path, e))?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                RegistryError::AuthenticationFailed {
                    message: format!("invalid CA certificate {}: {e}", path.display()),
                }
            })?;
            builder = builder.add_root_certificate(cert);
        }

        builder.build().map_err(|e| RegistryError::ConnectionFailed {
            url: "registry client".to_string(),
            source: e,
        })
    }

    /// Creates authentication headers based on configuration.
    fn auth_headers(&self) -> Result<HeaderMap, RegistryError> {
        let mut headers = HeaderMap::new();

        match &self.config.auth {
            RegistryAuth::None => {}
            RegistryAuth::Basic { username, password } => {
                let credentials = base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    format!("{username}:{password}"),
                );
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Basic {credentials}")).map_err(|_| {
                        RegistryError::AuthenticationFailed {
                            message: "Invalid credentials".to_string(),
                        }
                    })?,
                );
            }
            RegistryAuth::Bearer { token } => {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                        RegistryError::AuthenticationFailed {
                            message: "Invalid token".to_string(),
                        }
                    })?,
                );
            }
        }

        Ok(headers)
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429) || status.is_server_error()
}

/// Resolves an upload `Location` against the session URL and appends the digest.
fn upload_url(session: &str, location: &str, digest: &str) -> Result<String, RegistryError> {
    let base = Url::parse(session).map_err(|_| RegistryError::InvalidUrl {
        url: session.to_string(),
    })?;
    let mut url = base.join(location).map_err(|_| RegistryError::InvalidUrl {
        url: location.to_string(),
    })?;
    url.query_pairs_mut().append_pair("digest", digest);
    Ok(url.into())
}

/// Maps an unsuccessful response to an error, consuming its body.
async fn status_error(response: Response, reference: &str) -> RegistryError {
    let status = response.status();
    match status {
        StatusCode::NOT_FOUND => RegistryError::not_found(reference),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RegistryError::AuthenticationFailed {
            message: format!("{reference}: {status}"),
        },
        _ => RegistryError::HttpError {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        },
    }
}

/// Picks the manifest media type from the response, then the body.
fn manifest_media_type(content_type: Option<&str>, body: &[u8]) -> MediaType {
    let from_header = content_type
        .and_then(|value| value.split(';').next())
        .map(str::trim)
        .filter(|value| !value.is_empty() && *value != "application/json");
    if let Some(media_type) = from_header {
        return MediaType::new(media_type);
    }

    #[derive(serde::Deserialize)]
    struct MediaTypeField {
        #[serde(rename = "mediaType")]
        media_type: Option<String>,
    }
    serde_json::from_slice::<MediaTypeField>(body)
        .ok()
        .and_then(|head| head.media_type)
        .map_or_else(|| MediaType::new(MediaType::OCI_MANIFEST), MediaType::new)
}

#[async_trait]
impl Registry for RegistryClient {
    async fn list_tags(&self, repository: &Repository) -> Result<Vec<Tag>, RegistryError> {
        let mut tags = Vec::new();
        let mut page = 1u32;

        loop {
            let url = self.tags_url(repository, page);
            let response = self
                .send(|| Ok(self.http.get(&url).headers(self.auth_headers()?)))
                .await?;
            if !response.status().is_success() {
                return Err(status_error(response, &repository.to_string()).await);
            }

            let body: TagPage = response.json().await?;
            for entry in body.tags {
                tags.push(entry.into_tag()?);
            }

            if !body.has_additional {
                break;
            }
            page += 1;
        }

        tracing::debug!(repository = %repository, count = tags.len(), "Listed tags");
        Ok(tags)
    }

    async fn fetch_manifest(
        &self,
        repository: &Repository,
        reference: &str,
    ) -> Result<(Descriptor, Vec<u8>), RegistryError> {
        let url = self.v2_url(repository, &format!("manifests/{reference}"));
        let response = self
            .send(|| {
                Ok(self
                    .http
                    .get(&url)
                    .headers(self.auth_headers()?)
                    .header(ACCEPT, MANIFEST_ACCEPT))
            })
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response, &format!("{repository}:{reference}")).await);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let advertised = response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let data = response.bytes().await?.to_vec();

        let media_type = manifest_media_type(content_type.as_deref(), &data);
        let descriptor = Descriptor::from_bytes(media_type, &data);

        let expected = if reference.contains(':') {
            Some(reference.to_string())
        } else {
            advertised.filter(|digest| digest.starts_with("sha256:"))
        };
        if let Some(expected) = expected {
            if expected != descriptor.digest {
                return Err(RegistryError::DigestMismatch {
                    expected,
                    actual: descriptor.digest,
                });
            }
        }

        Ok((descriptor, data))
    }

    async fn fetch_blob(
        &self,
        repository: &Repository,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>, RegistryError> {
        let url = self.v2_url(repository, &format!("blobs/{}", descriptor.digest));
        let response = self
            .send(|| Ok(self.http.get(&url).headers(self.auth_headers()?)))
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response, &descriptor.digest).await);
        }

        let data = response.bytes().await?.to_vec();
        verify_content(descriptor, &data)?;
        Ok(data)
    }

    async fn blob_exists(
        &self,
        repository: &Repository,
        descriptor: &Descriptor,
    ) -> Result<bool, RegistryError> {
        let url = self.v2_url(repository, &format!("blobs/{}", descriptor.digest));
        let response = self
            .send(|| Ok(self.http.head(&url).headers(self.auth_headers()?)))
            .await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(status_error(response, &descriptor.digest).await),
        }
    }

    async fn push_blob(
        &self,
        repository: &Repository,
        descriptor: &Descriptor,
        data: Vec<u8>,
    ) -> Result<(), RegistryError> {
        verify_content(descriptor, &data)?;

        let start_url = self.v2_url(repository, "blobs/uploads/");
        let response = self
            .send(|| Ok(self.http.post(&start_url).headers(self.auth_headers()?)))
            .await?;
        if !response.status().is_success() {
            return Err(RegistryError::UploadFailed {
                message: format!("Failed to start upload: {}", response.status()),
            });
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RegistryError::UploadFailed {
                message: "No upload location returned".to_string(),
            })?;

        let commit_url = upload_url(&start_url, location, &descriptor.digest)?;

        let response = self
            .send(|| {
                Ok(self
                    .http
                    .put(&commit_url)
                    .headers(self.auth_headers()?)
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(data.clone()))
            })
            .await?;
        if !response.status().is_success() {
            return Err(RegistryError::UploadFailed {
                message: format!("Failed to upload blob: {}", response.status()),
            });
        }

        tracing::debug!(repository = %repository, digest = %descriptor.digest, "Uploaded blob");
        Ok(())
    }

    async fn push_manifest(
        &self,
        repository: &Repository,
        reference: &str,
        descriptor: &Descriptor,
        data: Vec<u8>,
    ) -> Result<(), RegistryError> {
        verify_content(descriptor, &data)?;

        let url = self.v2_url(repository, &format!("manifests/{reference}"));
        let response = self
            .send(|| {
                Ok(self
                    .http
                    .put(&url)
                    .headers(self.auth_headers()?)
                    .header(CONTENT_TYPE, descriptor.media_type.as_str())
                    .body(data.clone()))
            })
            .await?;

        if !response.status().is_success() {
            return Err(RegistryError::ManifestPushFailed {
                reference: format!("{repository}:{reference}"),
                message: format!(
                    "{}: {}",
                    response.status(),
                    response.text().await.unwrap_or_default()
                ),
            });
        }

        tracing::info!(
            repository = %repository,
            reference,
            digest = %descriptor.digest,
            "Pushed manifest"
        );
        Ok(())
    }
}

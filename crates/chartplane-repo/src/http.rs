//! HTTP transport for registry indices and package archives

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;
use url::Url;

use crate::config::{Credentials, Registry};
use crate::error::{RepoError, Result};
use crate::index::{PackEntry, RepositoryIndex};

/// Fetches raw bytes from a URL
#[async_trait]
pub trait ArchiveFetcher: Send + Sync {
    async fn fetch(&self, url: &str, credentials: Option<&Credentials>) -> Result<Vec<u8>>;
}

/// reqwest-backed fetcher
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RepoError::NetworkError {
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArchiveFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, credentials: Option<&Credentials>) -> Result<Vec<u8>> {
        let mut request = self.client.get(url);
        if let Some(creds) = credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RepoError::AuthRequired {
                url: url.to_string(),
            });
        }
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(RepoError::AuthFailed {
                message: format!("Access denied to {url}"),
            });
        }
        if !status.is_success() {
            return Err(RepoError::HttpError {
                status: status.as_u16(),
                message: format!("Request to {url} failed"),
            });
        }

        let bytes = response.bytes().await?;
        tracing::debug!(url = %url, bytes = bytes.len(), "fetched");
        Ok(bytes.to_vec())
    }
}

/// Resolve a possibly relative reference against a registry URL.
///
/// The registry URL is treated as a directory, so
/// `https://host/charts` + `web-1.0.0.tgz` gives `https://host/charts/web-1.0.0.tgz`.
pub fn resolve_reference_url(base: &str, reference: &str) -> Result<String> {
    if let Ok(absolute) = Url::parse(reference) {
        return Ok(absolute.to_string());
    }

    let directory = format!("{}/", base.trim_end_matches('/'));
    let base = Url::parse(&directory).map_err(|e| RepoError::InvalidRegistryUrl {
        url: base.to_string(),
        reason: e.to_string(),
    })?;
    Ok(base.join(reference)?.to_string())
}

/// Download a registry's index
pub async fn fetch_index(fetcher: &dyn ArchiveFetcher, registry: &Registry) -> Result<RepositoryIndex> {
    let credentials = registry.credentials()?;
    let bytes = fetcher.fetch(&registry.index_url(), credentials.as_ref()).await?;
    let index = RepositoryIndex::from_bytes(&bytes)?;
    tracing::debug!(registry = %registry.name, packages = index.entries.len(), "fetched index");
    Ok(index)
}

/// Download the archive of an index entry, verifying its digest when the index has one
pub async fn fetch_archive(
    fetcher: &dyn ArchiveFetcher,
    registry: &Registry,
    entry: &PackEntry,
) -> Result<Vec<u8>> {
    let reference = entry.download_url().ok_or_else(|| RepoError::MissingDownloadUrl {
        name: entry.name.clone(),
        version: entry.version.clone(),
    })?;
    let url = resolve_reference_url(&registry.url, reference)?;
    let credentials = registry.credentials()?;
    let data = fetcher.fetch(&url, credentials.as_ref()).await?;

    if let Some(expected) = &entry.digest {
        let actual = compute_digest(&data);
        if !digest_matches(expected, &actual) {
            return Err(RepoError::IntegrityCheckFailed {
                name: format!("{}-{}", entry.name, entry.version),
                expected: expected.clone(),
                actual,
            });
        }
    }
    Ok(data)
}

/// `sha256:<hex>` digest of data
pub fn compute_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn digest_matches(expected: &str, actual: &str) -> bool {
    let normalize = |d: &str| {
        d.trim()
            .to_lowercase()
            .trim_start_matches("sha256:")
            .to_string()
    };
    normalize(expected) == normalize(actual)
}

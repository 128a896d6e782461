//! Release artifact source: download an asset of a published release

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::deploy::fetcher::{artifact_file, ArtifactFetcher};
use crate::errors::{FetchError, WardenError};
use crate::filesys::dir::Dir;
use crate::filesys::file::{File, ScratchFile};
use crate::models::artifact::{DeploymentArtifact, FetchTarget};
use crate::utils::{sha256_file, sha256_hex};

/// Timeout for release metadata lookups
const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Release source configuration
#[derive(Debug, Clone)]
pub struct ReleaseSource {
    /// API root, e.g. `https://api.github.com`
    pub api_base: String,
    /// `owner/name`
    pub repo: String,
    pub asset_name: String,
    pub token: Option<SecretString>,
    pub download_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
struct ReleaseAsset {
    name: String,
    url: String,
    browser_download_url: String,
}

/// Fetches artifacts from a GitHub-style releases API
pub struct ReleaseFetcher {
    source: ReleaseSource,
    client: Client,
    artifacts_dir: Dir,
}

impl ReleaseFetcher {
    pub fn new(source: ReleaseSource, artifacts_dir: Dir) -> Result<Self, WardenError> {
        let client = Client::builder()
            .user_agent(format!("warden/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            source: ReleaseSource {
                api_base: source.api_base.trim_end_matches('/').to_string(),
                ..source
            },
            client,
            artifacts_dir,
        })
    }

    fn release_url(&self, target: &FetchTarget) -> String {
        match target {
            FetchTarget::Latest => {
                format!("{}/repos/{}/releases/latest", self.source.api_base, self.source.repo)
            }
            FetchTarget::Version(tag) => format!(
                "{}/repos/{}/releases/tags/{}",
                self.source.api_base, self.source.repo, tag
            ),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.source.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    async fn release(&self, target: &FetchTarget) -> Result<Release, FetchError> {
        let url = self.release_url(target);
        debug!("GET {}", url);

        let request = self
            .client
            .get(&url)
            .timeout(API_TIMEOUT)
            .header(header::ACCEPT, "application/vnd.github+json");
        let response = self.authorize(request).send().await.map_err(network_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &format!("release lookup {}", url), &body));
        }

        response
            .json::<Release>()
            .await
            .map_err(|e| FetchError::Network(format!("invalid release payload: {}", e)))
    }

    /// Stream an asset to a scratch file next to `destination`, then rename it into place
    async fn download(&self, asset: &ReleaseAsset, destination: &File) -> Result<String, FetchError> {
        let request = if self.source.token.is_some() {
            self.authorize(self.client.get(&asset.url))
                .header(header::ACCEPT, "application/octet-stream")
        } else {
            self.client.get(&asset.browser_download_url)
        };
        info!("Downloading release asset {}", asset.name);

        let mut response = request
            .timeout(self.source.download_timeout)
            .send()
            .await
            .map_err(network_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &format!("download of {}", asset.name), &body));
        }

        destination.create_parent().await.map_err(storage_error)?;
        sweep_scratch_files(destination).await;

        let scratch = ScratchFile::beside(destination);
        let mut file = tokio::fs::File::create(scratch.path())
            .await
            .map_err(|e| storage_error(e.into()))?;
        let mut hasher = Sha256::new();
        while let Some(chunk) = response.chunk().await.map_err(network_error)? {
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| storage_error(e.into()))?;
        }
        file.sync_all().await.map_err(|e| storage_error(e.into()))?;
        drop(file);
        scratch.persist(destination).await.map_err(storage_error)?;
        Ok(sha256_hex(hasher))
    }
}

/// Drop scratch files of downloads that never finished
async fn sweep_scratch_files(destination: &File) {
    let Some(parent) = destination.path().parent() else {
        return;
    };
    match Dir::new(parent).remove_scratch_files().await {
        Ok(0) => {}
        Ok(n) => debug!("Removed {} stale partial download(s) in {}", n, parent.display()),
        Err(e) => warn!("Failed to sweep partial downloads in {}: {}", parent.display(), e),
    }
}

#[async_trait]
impl ArtifactFetcher for ReleaseFetcher {
    fn describe(&self) -> String {
        format!("release {} ({})", self.source.repo, self.source.asset_name)
    }

    async fn latest_version(&self) -> Result<String, FetchError> {
        Ok(self.release(&FetchTarget::Latest).await?.tag_name)
    }

    async fn fetch(&self, target: &FetchTarget) -> Result<DeploymentArtifact, FetchError> {
        let release = self.release(target).await?;
        let asset = release
            .assets
            .iter()
            .find(|asset| asset.name == self.source.asset_name)
            .ok_or_else(|| {
                FetchError::NotFound(format!(
                    "release {} has no asset named {}",
                    release.tag_name, self.source.asset_name
                ))
            })?;

        let destination = artifact_file(&self.artifacts_dir, &release.tag_name, &asset.name);
        let sha256 = if destination.exists().await {
            debug!("Artifact for {} already present", release.tag_name);
            sha256_file(destination.path()).await.map_err(storage_error)?
        } else {
            self.download(asset, &destination).await?
        };
        destination.set_executable().await.map_err(storage_error)?;

        info!("Fetched release {} ({})", release.tag_name, destination.path().display());
        Ok(DeploymentArtifact {
            version: release.tag_name.clone(),
            source: asset.browser_download_url.clone(),
            path: destination.path().to_path_buf(),
            sha256,
            fetched_at: Utc::now(),
        })
    }
}

fn network_error(e: reqwest::Error) -> FetchError {
    FetchError::Network(e.to_string())
}

fn storage_error(e: WardenError) -> FetchError {
    FetchError::Command(format!("failed to store artifact: {}", e))
}

fn status_error(status: StatusCode, what: &str, body: &str) -> FetchError {
    let detail = format!("{} returned {}: {}", what, status, body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::Auth(detail),
        StatusCode::NOT_FOUND => FetchError::NotFound(detail),
        _ => FetchError::Network(detail),
    }
}

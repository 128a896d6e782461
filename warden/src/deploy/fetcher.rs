//! Artifact fetching

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::deploy::git::{GitFetcher, GitSource};
use crate::deploy::release::{ReleaseFetcher, ReleaseSource};
use crate::errors::{FetchError, WardenError};
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::artifact::{DeploymentArtifact, FetchTarget};
use crate::storage::settings::SourceSettings;

/// Resolves and downloads deployable artifacts.
///
/// Implementations must never leave a partial file at the canonical artifact
/// path: content is written to a scratch file and renamed on success.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Human readable description of the source
    fn describe(&self) -> String;

    /// Version marker of the newest artifact at the source, without downloading it
    async fn latest_version(&self) -> Result<String, FetchError>;

    /// Resolve `target` and store the artifact locally
    async fn fetch(&self, target: &FetchTarget) -> Result<DeploymentArtifact, FetchError>;
}

/// Build the fetcher described by the settings
pub fn from_settings(
    source: &SourceSettings,
    artifacts_dir: Dir,
) -> Result<Arc<dyn ArtifactFetcher>, WardenError> {
    let fetcher: Arc<dyn ArtifactFetcher> = match source {
        SourceSettings::Git {
            repo_dir,
            repo_url,
            remote,
            branch,
            build_cmd,
            artifact_path,
            command_timeout_secs,
        } => Arc::new(GitFetcher::new(
            GitSource {
                repo_dir: repo_dir.clone(),
                repo_url: repo_url.clone(),
                remote: remote.clone(),
                branch: branch.clone(),
                build_cmd: build_cmd.clone(),
                artifact_path: artifact_path.clone(),
                command_timeout: Duration::from_secs(*command_timeout_secs),
            },
            artifacts_dir,
        )),
        SourceSettings::Release {
            api_base,
            repo,
            asset_name,
            token,
            download_timeout_secs,
        } => Arc::new(ReleaseFetcher::new(
            ReleaseSource {
                api_base: api_base.clone(),
                repo: repo.clone(),
                asset_name: asset_name.clone(),
                token: token.clone(),
                download_timeout: Duration::from_secs(*download_timeout_secs),
            },
            artifacts_dir,
        )?),
    };
    Ok(fetcher)
}

/// Deterministic local path of an artifact version
pub fn artifact_file(artifacts_dir: &Dir, version: &str, file_name: &str) -> File {
    artifacts_dir
        .subdir(&sanitize_component(version))
        .file(&sanitize_component(file_name))
}

/// Make a version or file name safe to use as a single path component
fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .replace("..", "_");
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}

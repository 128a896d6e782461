//! Git artifact source: pull, build, take the build output

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info};

use crate::deploy::fetcher::{artifact_file, ArtifactFetcher};
use crate::errors::FetchError;
use crate::filesys::dir::Dir;
use crate::models::artifact::{DeploymentArtifact, FetchTarget};
use crate::utils::sha256_file;

/// Git source configuration
#[derive(Debug, Clone)]
pub struct GitSource {
    pub repo_dir: PathBuf,
    pub repo_url: Option<String>,
    pub remote: String,
    pub branch: String,
    pub build_cmd: Option<String>,
    /// Build output, relative to `repo_dir`
    pub artifact_path: PathBuf,
    /// Bound on each git or build command
    pub command_timeout: Duration,
}

/// Fetches artifacts by pulling and building a git checkout
pub struct GitFetcher {
    source: GitSource,
    artifacts_dir: Dir,
}

impl GitFetcher {
    pub fn new(source: GitSource, artifacts_dir: Dir) -> Self {
        Self {
            source,
            artifacts_dir,
        }
    }

    async fn run(&self, program: &str, args: &[&str], cwd: Option<&Path>) -> Result<String, FetchError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .env("GIT_TERMINAL_PROMPT", "0");
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let output = tokio::time::timeout(self.source.command_timeout, command.output())
            .await
            .map_err(|_| {
                FetchError::Command(format!(
                    "{} {} timed out after {:?}",
                    program,
                    args.join(" "),
                    self.source.command_timeout
                ))
            })?
            .map_err(|e| FetchError::Command(format!("failed to run {}: {}", program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_git_failure(
                &format!("{} {}", program, args.first().copied().unwrap_or_default()),
                &stderr,
            ));
        }
        Ok(stdout)
    }

    async fn git(&self, args: &[&str]) -> Result<String, FetchError> {
        self.run("git", args, Some(&self.source.repo_dir)).await
    }

    /// Clone the repository if it is not there yet
    async fn ensure_checkout(&self) -> Result<(), FetchError> {
        if self.source.repo_dir.join(".git").exists() {
            return Ok(());
        }

        let url = self.source.repo_url.as_deref().ok_or_else(|| {
            FetchError::NotFound(format!(
                "{} is not a git checkout and no repo_url is configured",
                self.source.repo_dir.display()
            ))
        })?;

        let target = self.source.repo_dir.to_string_lossy().into_owned();
        debug!("Cloning repository to {}...", target);
        self.run("git", &["clone", "-b", &self.source.branch, url, &target], None)
            .await?;
        Ok(())
    }

    async fn sync(&self, target: &FetchTarget) -> Result<String, FetchError> {
        self.ensure_checkout().await?;

        match target {
            FetchTarget::Latest => {
                debug!("Pulling {} {}", self.source.remote, self.source.branch);
                let output = self
                    .git(&["pull", "--ff-only", &self.source.remote, &self.source.branch])
                    .await?;
                if output.contains("Already up to date") {
                    debug!("Repository already up to date");
                }
            }
            FetchTarget::Version(reference) => {
                self.git(&["fetch", &self.source.remote]).await?;
                self.git(&["checkout", "--detach", reference]).await?;
            }
        }

        let head = self.git(&["rev-parse", "HEAD"]).await?;
        Ok(head.trim().to_string())
    }

    async fn build(&self) -> Result<(), FetchError> {
        let Some(build_cmd) = self.source.build_cmd.as_deref().filter(|c| !c.trim().is_empty())
        else {
            return Ok(());
        };

        info!("Running build command: {}", build_cmd);
        let output = self
            .run("sh", &["-c", build_cmd], Some(&self.source.repo_dir))
            .await
            .map_err(|e| match e {
                FetchError::Command(msg) => FetchError::Command(format!("build failed: {}", msg)),
                other => FetchError::Command(format!("build failed: {}", other)),
            })?;
        debug!("Build output: {}", tail(&output, 2000));
        Ok(())
    }

    fn source_label(&self) -> String {
        match &self.source.repo_url {
            Some(url) => format!("{}#{}", url, self.source.branch),
            None => format!("{}#{}", self.source.repo_dir.display(), self.source.branch),
        }
    }
}

#[async_trait]
impl ArtifactFetcher for GitFetcher {
    fn describe(&self) -> String {
        format!("git {}", self.source_label())
    }

    async fn latest_version(&self) -> Result<String, FetchError> {
        let reference = format!("refs/heads/{}", self.source.branch);
        let output = if self.source.repo_dir.join(".git").exists() {
            self.git(&["ls-remote", &self.source.remote, &reference]).await?
        } else {
            let url = self.source.repo_url.as_deref().ok_or_else(|| {
                FetchError::NotFound("no checkout and no repo_url configured".to_string())
            })?;
            self.run("git", &["ls-remote", url, &reference], None).await?
        };

        parse_ls_remote(&output).ok_or_else(|| {
            FetchError::NotFound(format!("branch '{}' not found on remote", self.source.branch))
        })
    }

    async fn fetch(&self, target: &FetchTarget) -> Result<DeploymentArtifact, FetchError> {
        info!("Fetching {:?} from {}", target, self.source_label());
        let version = self.sync(target).await?;

        let file_name = self
            .source
            .artifact_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        let destination = artifact_file(&self.artifacts_dir, &version, &file_name);

        if !destination.exists().await {
            self.build().await?;

            let built = self.source.repo_dir.join(&self.source.artifact_path);
            if !built.is_file() {
                return Err(FetchError::NotFound(format!(
                    "build output {} does not exist",
                    built.display()
                )));
            }
            destination
                .copy_from_atomic(&built)
                .await
                .map_err(|e| FetchError::Command(format!("failed to store artifact: {}", e)))?;
        } else {
            debug!("Artifact for {} already present", version);
        }

        let sha256 = sha256_file(destination.path())
            .await
            .map_err(|e| FetchError::Command(format!("failed to hash artifact: {}", e)))?;

        info!("Fetched artifact {} ({})", version, destination.path().display());
        Ok(DeploymentArtifact {
            version,
            source: self.source_label(),
            path: destination.path().to_path_buf(),
            sha256,
            fetched_at: Utc::now(),
        })
    }
}

/// Map a failed git invocation onto the fetch error taxonomy
pub fn classify_git_failure(what: &str, stderr: &str) -> FetchError {
    let lower = stderr.to_lowercase();
    let detail = format!("{} failed: {}", what, stderr.trim());

    if lower.contains("authentication failed")
        || lower.contains("could not read username")
        || lower.contains("permission denied")
        || lower.contains("terminal prompts disabled")
    {
        FetchError::Auth(detail)
    } else if lower.contains("could not resolve host")
        || lower.contains("unable to access")
        || lower.contains("connection timed out")
        || lower.contains("connection refused")
        || lower.contains("network is unreachable")
    {
        FetchError::Network(detail)
    } else if lower.contains("repository not found")
        || lower.contains("does not appear to be a git repository")
        || lower.contains("couldn't find remote ref")
        || lower.contains("did not match any")
        || lower.contains("unknown revision")
    {
        FetchError::NotFound(detail)
    } else {
        FetchError::Command(detail)
    }
}

/// Extract the commit hash from `git ls-remote` output
fn parse_ls_remote(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .find(|hash| !hash.is_empty())
        .map(str::to_string)
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

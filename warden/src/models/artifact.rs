//! Deployable artifacts

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A fetched, deployable build output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentArtifact {
    /// Version marker (commit hash or release tag)
    pub version: String,

    /// Where it came from (repository URL or release asset URL)
    pub source: String,

    /// Local path of the artifact
    pub path: PathBuf,

    /// SHA-256 of the artifact contents
    pub sha256: String,

    /// When the artifact was fetched
    pub fetched_at: DateTime<Utc>,
}

/// What the fetcher should resolve
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FetchTarget {
    /// Newest artifact available at the source
    #[default]
    Latest,

    /// A specific version (commit, branch or release tag)
    Version(String),
}

/// What caused a redeploy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    /// Operator request through the control surface
    Manual,

    /// Artifact-check worker found a newer version
    Poll,

    /// Source control webhook
    Webhook,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerSource::Manual => write!(f, "manual"),
            TriggerSource::Poll => write!(f, "poll"),
            TriggerSource::Webhook => write!(f, "webhook"),
        }
    }
}

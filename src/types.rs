//! # Core Types
//!
//! Fundamental types shared by the orchestrator, the HTTP surface, and the
//! worker processes.

use std::fmt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a job.
///
/// Always of the form `<node-name>-<uuid-v4>`. The node-name prefix is the
/// sole ownership-resolution mechanism in the cluster: any node can tell
/// which peer owns a job by matching the prefix against the configured node
/// list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Mint a fresh id owned by `node`.
    pub fn new(node: &str) -> Self {
        Self(format!("{}-{}", node, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if this id is prefixed with `node` followed by the separator.
    pub fn is_owned_by(&self, node: &str) -> bool {
        self.0
            .strip_prefix(node)
            .map(|rest| rest.starts_with('-'))
            .unwrap_or(false)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Job lifecycle states.
///
/// The only legal transitions are `queued -> processing -> {completed |
/// failed}`, plus the recovery path `processing -> queued` taken when a
/// worker died without finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(OrchestratorError::Validation(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

/// Execution strategy for a job. Opaque to the orchestrator; consumed by the
/// pipeline collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    Pipeline,
    Agent,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Pipeline => "pipeline",
            JobMode::Agent => "agent",
        }
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobMode {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pipeline" => Ok(JobMode::Pipeline),
            "agent" => Ok(JobMode::Agent),
            other => Err(OrchestratorError::Validation(format!(
                "unknown job mode: {other}"
            ))),
        }
    }
}

/// What a job should classify. Validated once at creation time; nothing
/// downstream branches on raw strings to recover the kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum JobInput {
    /// A remote media URL (http/https).
    Url(String),
    /// A filesystem path already present on the owning node.
    Path(String),
    /// A file uploaded through the API, stored under the upload directory.
    Upload(String),
}

impl JobInput {
    pub fn kind(&self) -> &'static str {
        match self {
            JobInput::Url(_) => "url",
            JobInput::Path(_) => "path",
            JobInput::Upload(_) => "upload",
        }
    }

    /// The URL or path itself.
    pub fn value(&self) -> &str {
        match self {
            JobInput::Url(v) | JobInput::Path(v) | JobInput::Upload(v) => v,
        }
    }

    /// Rebuild from the two columns the store keeps.
    pub fn from_parts(kind: &str, value: String) -> Result<Self, OrchestratorError> {
        match kind {
            "url" => Ok(JobInput::Url(value)),
            "path" => Ok(JobInput::Path(value)),
            "upload" => Ok(JobInput::Upload(value)),
            other => Err(OrchestratorError::Validation(format!(
                "unknown input kind: {other}"
            ))),
        }
    }
}

/// Error types for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job id prefix does not resolve to a configured node: {0}")]
    OwnerUnknown(JobId),

    #[error("owner node unreachable: {0}")]
    Upstream(String),

    #[error("no healthy nodes available")]
    NoHealthyNodes,

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Result type for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

//! Hosting-API gateway port.
//!
//! The coordinator never talks to the network itself; every branch, merge,
//! label and comment operation goes through a [`HostingGateway`]. Failures
//! are typed so the state machine can tell an authoritative answer
//! (`AlreadyExists`, `NotFound`, `Conflict`) from an unknown outcome
//! (`Timeout`, `Transient`).

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::state_machine::state::{CommitSha, RepositoryKey};

/// Errors a gateway call can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The ref being created is already there.
    #[error("already exists")]
    AlreadyExists,
    /// The ref, pull request or issue does not exist.
    #[error("not found")]
    NotFound,
    /// The merge could not be performed without manual resolution.
    #[error("merge conflict: {0}")]
    Conflict(String),
    /// No answer within the deadline; the outcome is unknown.
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    /// Any other failure (network, 5xx, unexpected response).
    #[error("{0}")]
    Transient(String),
}

impl GatewayError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// True when the outcome of a mutating call is unknown.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transient(_))
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// What the coordinator needs to know about a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequestInfo {
    pub number: u64,
    pub head_sha: CommitSha,
    /// Owner of the repository the head branch lives in. `None` when the
    /// fork has been deleted.
    pub head_owner: Option<String>,
    pub head_repo: Option<String>,
    pub head_branch: String,
    pub base_branch: String,
    pub open: bool,
}

impl PullRequestInfo {
    /// Repository holding the head branch, if it still exists.
    pub fn head_repository(&self) -> Option<RepositoryKey> {
        match (&self.head_owner, &self.head_repo) {
            (Some(owner), Some(name)) => Some(RepositoryKey::new(owner.clone(), name.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IssueInfo {
    pub labels: BTreeSet<String>,
}

/// Tip of a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchHead {
    pub sha: CommitSha,
    /// Full message of the tip commit.
    pub message: String,
}

/// Capabilities the coordinator consumes from the hosting service.
///
/// Every call is scoped to one repository. Implementations should not retry
/// mutating calls on their own; the caller decides what an indeterminate
/// outcome means.
#[async_trait]
pub trait HostingGateway: Send + Sync {
    async fn get_pull_request(
        &self,
        repo: &RepositoryKey,
        number: u64,
    ) -> GatewayResult<PullRequestInfo>;

    async fn get_issue(&self, repo: &RepositoryKey, number: u64) -> GatewayResult<IssueInfo>;

    /// Look up a branch. `Ok(None)` means it does not exist.
    async fn get_branch(&self, repo: &RepositoryKey, name: &str)
        -> GatewayResult<Option<BranchHead>>;

    /// Create `name` pointing at `from`. Fails with `AlreadyExists` if the
    /// branch is already there.
    async fn create_branch(
        &self,
        repo: &RepositoryKey,
        name: &str,
        from: &CommitSha,
    ) -> GatewayResult<()>;

    /// Delete `name`. Fails with `NotFound` if it was already gone.
    async fn delete_branch(&self, repo: &RepositoryKey, name: &str) -> GatewayResult<()>;

    /// Merge `source` into `target`, returning the resulting commit.
    async fn merge(
        &self,
        repo: &RepositoryKey,
        target: &str,
        source: &CommitSha,
        message: &str,
    ) -> GatewayResult<CommitSha>;

    /// Replace the issue's labels with `labels`.
    async fn set_labels(
        &self,
        repo: &RepositoryKey,
        number: u64,
        labels: &BTreeSet<String>,
    ) -> GatewayResult<()>;

    async fn assign(&self, repo: &RepositoryKey, number: u64, logins: &[String])
        -> GatewayResult<()>;

    async fn comment(&self, repo: &RepositoryKey, number: u64, body: &str) -> GatewayResult<()>;
}

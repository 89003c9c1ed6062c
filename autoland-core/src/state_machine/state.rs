//! State types for the per-repository merge queue.
//!
//! Between inbound events a repository is either `Idle` or `Testing`. The
//! other variants are staging states that only exist while one inbound event
//! is being worked through the gateway; the worker never leaves a repository
//! in one of them.

use std::fmt;

use serde::Serialize;

use crate::gateway::{GatewayError, PullRequestInfo};
use crate::state_machine::event::Operation;

/// Newtype for commit SHA to prevent mixing with other strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CommitSha(pub String);

impl CommitSha {
    /// Returns a truncated SHA for display (first 7 characters).
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(7) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for CommitSha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CommitSha {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CommitSha {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifies one independent queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RepositoryKey {
    pub owner: String,
    pub name: String,
}

impl RepositoryKey {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse `owner/name`.
    pub fn parse(full_name: &str) -> Option<Self> {
        let (owner, name) = full_name.trim().split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(owner, name))
    }
}

impl fmt::Display for RepositoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptMode {
    /// `try`: validate only.
    DryRun,
    /// `r+`: validate, then land.
    Merge,
}

impl AttemptMode {
    /// The comment verb that requests this mode.
    pub fn verb(self) -> &'static str {
        match self {
            Self::DryRun => "try",
            Self::Merge => "r+",
        }
    }

    pub fn from_verb(verb: &str) -> Option<Self> {
        match verb {
            "try" => Some(Self::DryRun),
            "r+" => Some(Self::Merge),
            _ => None,
        }
    }
}

impl fmt::Display for AttemptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// The one in-flight integration attempt of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrationAttempt {
    pub pr_number: u64,
    pub mode: AttemptMode,
    pub base_branch: String,
    /// Base-branch tip the integration branch was forked from.
    pub base_sha: CommitSha,
    /// Pull request head at admission. Landing merges exactly this commit.
    pub head_sha: CommitSha,
    /// Tip of the integration branch after the head was merged in, when known.
    pub integration_sha: Option<CommitSha>,
    pub requested_by: String,
    /// Set once the head has been merged into the base branch.
    pub landed_sha: Option<CommitSha>,
}

/// A request to start an attempt, carried through admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub pr_number: u64,
    pub mode: AttemptMode,
    pub requested_by: String,
}

/// Progress through admission. Each stage waits for one gateway answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionStage {
    /// Checking whether the integration branch already exists.
    Probing,
    FetchingPullRequest,
    ResolvingBase { pr: PullRequestInfo },
    CreatingBranch {
        pr: PullRequestInfo,
        base_sha: CommitSha,
    },
    MergingHead {
        pr: PullRequestInfo,
        base_sha: CommitSha,
    },
    /// Deleting a half-built integration branch after `failure`.
    RollingBack { failure: AdmissionFailure },
}

/// Why an admission was abandoned after it started touching the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdmissionFailure {
    MergeConflict,
    PullRequestClosed,
    BaseBranchMissing { branch: String },
    Gateway { operation: Operation, error: String },
}

impl AdmissionFailure {
    pub fn gateway(operation: Operation, error: &GatewayError) -> Self {
        Self::Gateway {
            operation,
            error: error.to_string(),
        }
    }
}

impl fmt::Display for AdmissionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MergeConflict => write!(f, "merge conflict"),
            Self::PullRequestClosed => write!(f, "pull request is closed"),
            Self::BaseBranchMissing { branch } => write!(f, "base branch `{}` not found", branch),
            Self::Gateway { operation, error } => write!(f, "{} failed: {}", operation, error),
        }
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    /// CI passed on a dry run.
    Passed,
    /// CI passed and the head was merged into the base branch.
    Landed { sha: CommitSha },
    Failed,
    /// CI passed but the head no longer merges cleanly into the base.
    MergeConflict,
    /// The pull request head moved after approval.
    HeadChanged { current: CommitSha },
    PullRequestClosed,
    /// The integration branch vanished underneath the attempt.
    BranchLost,
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Passed | Self::Landed { .. })
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Landed { sha } => write!(f, "landed as {}", sha.short()),
            Self::Failed => write!(f, "failed"),
            Self::MergeConflict => write!(f, "merge conflict with base"),
            Self::HeadChanged { current } => {
                write!(f, "head changed to {} after approval", current.short())
            }
            Self::PullRequestClosed => write!(f, "pull request closed"),
            Self::BranchLost => write!(f, "integration branch lost"),
        }
    }
}

/// Per-repository queue state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum QueueState {
    /// No attempt in flight; the integration branch should not exist.
    #[default]
    Idle,

    /// Working through admission of a new attempt.
    Admitting {
        request: StartRequest,
        stage: AdmissionStage,
    },

    /// An attempt holds the integration branch and awaits CI.
    Testing { attempt: IntegrationAttempt },

    /// CI passed on an `r+` attempt; merging into the base branch.
    /// `pull_request` is filled in once the PR has been re-fetched.
    Landing {
        attempt: IntegrationAttempt,
        pull_request: Option<PullRequestInfo>,
    },

    /// The attempt is over; deleting the integration branch.
    Releasing {
        attempt: IntegrationAttempt,
        verdict: Verdict,
    },

    /// Comparing local state against the remote integration branch.
    Reconciling {
        attempt: Option<IntegrationAttempt>,
    },
}

impl QueueState {
    /// True for `Idle` and `Testing`, the only states visible between events.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Idle | Self::Testing { .. })
    }

    pub fn attempt(&self) -> Option<&IntegrationAttempt> {
        match self {
            Self::Testing { attempt }
            | Self::Landing { attempt, .. }
            | Self::Releasing { attempt, .. } => Some(attempt),
            Self::Reconciling { attempt } => attempt.as_ref(),
            Self::Idle | Self::Admitting { .. } => None,
        }
    }

    /// Collapse a staging state to the settled state it stands for.
    ///
    /// Used only when an event sequence ends somewhere unexpected. An
    /// attempt that was still holding the branch stays `Testing` so that
    /// reconciliation can sort it out; a half-finished admission goes back
    /// to `Idle`.
    pub fn settle(self) -> Self {
        match self {
            Self::Idle | Self::Admitting { .. } => Self::Idle,
            Self::Testing { attempt }
            | Self::Landing { attempt, .. }
            | Self::Releasing { attempt, .. } => Self::Testing { attempt },
            Self::Reconciling { attempt } => match attempt {
                Some(attempt) => Self::Testing { attempt },
                None => Self::Idle,
            },
        }
    }

    pub fn status(&self) -> QueueStatus {
        match self.attempt() {
            Some(attempt) => QueueStatus::Testing {
                pr_number: attempt.pr_number,
                mode: attempt.mode,
                head_sha: attempt.head_sha.clone(),
                integration_sha: attempt.integration_sha.clone(),
            },
            None => QueueStatus::Idle,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Admitting { .. } => "Admitting",
            Self::Testing { .. } => "Testing",
            Self::Landing { .. } => "Landing",
            Self::Releasing { .. } => "Releasing",
            Self::Reconciling { .. } => "Reconciling",
        }
    }
}

/// Externally visible summary of a repository's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum QueueStatus {
    Idle,
    Testing {
        pr_number: u64,
        mode: AttemptMode,
        head_sha: CommitSha,
        integration_sha: Option<CommitSha>,
    },
}

impl QueueStatus {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn pr_number(&self) -> Option<u64> {
        match self {
            Self::Idle => None,
            Self::Testing { pr_number, .. } => Some(*pr_number),
        }
    }
}

//! Events that trigger state transitions.
//!
//! Inbound events come from comments, CI callbacks and reconciliation.
//! Every gateway effect answers with exactly one result event, either the
//! success event for that operation or `GatewayFailed`.

use std::fmt;

use serde::Serialize;

use super::state::{AttemptMode, CommitSha, StartRequest};
use crate::gateway::{BranchHead, GatewayError, PullRequestInfo};

/// Outcome reported by the CI provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CiStatus {
    Passed,
    Failed,
    /// Anything else (`errored`, `canceled`, ...). Inconclusive.
    Unrecognized(String),
}

impl CiStatus {
    pub fn parse(state: &str) -> Self {
        match state.trim() {
            "passed" => Self::Passed,
            "failed" => Self::Failed,
            other => Self::Unrecognized(other.to_string()),
        }
    }
}

impl fmt::Display for CiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::Unrecognized(state) => write!(f, "{}", state),
        }
    }
}

/// A CI build finished on some branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiReport {
    pub branch: String,
    pub status: CiStatus,
    /// Commit that was built, when the provider says.
    pub commit: Option<CommitSha>,
    /// Message of the built commit, when the provider says.
    pub message: Option<String>,
    pub build_url: Option<String>,
}

impl CiReport {
    pub fn new(branch: impl Into<String>, status: CiStatus) -> Self {
        Self {
            branch: branch.into(),
            status,
            commit: None,
            message: None,
            build_url: None,
        }
    }
}

/// Gateway operations, for attributing failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ProbeIntegrationBranch,
    FetchPullRequest,
    ResolveBaseHead,
    CreateIntegrationBranch,
    MergeIntoIntegration,
    MergeIntoBase,
    DeleteIntegrationBranch,
    DeleteSourceBranch,
    UpdateLabels,
    Assign,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::ProbeIntegrationBranch => "checking the integration branch",
            Self::FetchPullRequest => "fetching the pull request",
            Self::ResolveBaseHead => "resolving the base branch",
            Self::CreateIntegrationBranch => "creating the integration branch",
            Self::MergeIntoIntegration => "merging into the integration branch",
            Self::MergeIntoBase => "merging into the base branch",
            Self::DeleteIntegrationBranch => "deleting the integration branch",
            Self::DeleteSourceBranch => "deleting the source branch",
            Self::UpdateLabels => "updating labels",
            Self::Assign => "assigning the pull request",
        };
        f.write_str(text)
    }
}

/// All events that can trigger state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    // =========================================================================
    // Inbound
    // =========================================================================
    /// An authorized reviewer asked for `try` or `r+`.
    StartRequested(StartRequest),

    /// An authorized reviewer asked for `r?`.
    ReviewAssignmentRequested { pr_number: u64, assignee: String },

    CiReported(CiReport),

    /// Compare local state with the remote integration branch.
    ReconcileRequested,

    // =========================================================================
    // Gateway results
    // =========================================================================
    IntegrationBranchProbed { head: Option<BranchHead> },

    PullRequestFetched(PullRequestInfo),

    /// `None` when the base branch does not exist.
    BaseHeadResolved { sha: Option<CommitSha> },

    IntegrationBranchCreated,

    HeadMergedIntoIntegration { sha: CommitSha },

    /// The approved head was merged into the base branch.
    Landed { sha: CommitSha },

    IntegrationBranchDeleted,

    /// A gateway call the state machine is waiting on failed.
    GatewayFailed {
        operation: Operation,
        error: GatewayError,
    },

    /// A best-effort call (labels, assignment, source branch) failed.
    SideEffectFailed {
        operation: Operation,
        /// Issue the call was about, when it was about one.
        pr_number: Option<u64>,
        error: GatewayError,
    },
}

impl Event {
    /// Returns a compact summary of the event for logging.
    pub fn log_summary(&self) -> String {
        match self {
            Event::StartRequested(request) => format!(
                "StartRequested {{ pr: #{}, mode: {}, by: {} }}",
                request.pr_number,
                request.mode.verb(),
                request.requested_by
            ),
            Event::ReviewAssignmentRequested {
                pr_number,
                assignee,
            } => format!(
                "ReviewAssignmentRequested {{ pr: #{}, assignee: {} }}",
                pr_number, assignee
            ),
            Event::CiReported(report) => format!(
                "CiReported {{ branch: {}, status: {}, commit: {} }}",
                report.branch,
                report.status,
                report.commit.as_ref().map_or("-", |sha| sha.short())
            ),
            Event::ReconcileRequested => "ReconcileRequested".to_string(),
            Event::IntegrationBranchProbed { head } => match head {
                Some(head) => format!("IntegrationBranchProbed {{ head: {} }}", head.sha.short()),
                None => "IntegrationBranchProbed { absent }".to_string(),
            },
            Event::PullRequestFetched(pr) => format!(
                "PullRequestFetched {{ pr: #{}, head: {}, open: {} }}",
                pr.number,
                pr.head_sha.short(),
                pr.open
            ),
            Event::BaseHeadResolved { sha } => format!(
                "BaseHeadResolved {{ sha: {} }}",
                sha.as_ref().map_or("-", |sha| sha.short())
            ),
            Event::IntegrationBranchCreated => "IntegrationBranchCreated".to_string(),
            Event::HeadMergedIntoIntegration { sha } => {
                format!("HeadMergedIntoIntegration {{ sha: {} }}", sha.short())
            }
            Event::Landed { sha } => format!("Landed {{ sha: {} }}", sha.short()),
            Event::IntegrationBranchDeleted => "IntegrationBranchDeleted".to_string(),
            Event::GatewayFailed { operation, error } => {
                format!("GatewayFailed {{ {:?}: {} }}", operation, error)
            }
            Event::SideEffectFailed {
                operation, error, ..
            } => {
                format!("SideEffectFailed {{ {:?}: {} }}", operation, error)
            }
        }
    }

    /// True for events that arrive from outside rather than from an effect.
    pub fn is_inbound(&self) -> bool {
        matches!(
            self,
            Event::StartRequested(_)
                | Event::ReviewAssignmentRequested { .. }
                | Event::CiReported(_)
                | Event::ReconcileRequested
        )
    }
}

/// Convenience constructor for start requests.
pub fn start_requested(pr_number: u64, mode: AttemptMode, requested_by: &str) -> Event {
    Event::StartRequested(StartRequest {
        pr_number,
        mode,
        requested_by: requested_by.to_string(),
    })
}

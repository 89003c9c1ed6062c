//! Structured results of processing one inbound event.
//!
//! The web layer derives its response tokens from [`Reason`]; nothing in
//! the state machine produces those strings itself.

use std::fmt;

use super::effect::Notice;
use super::event::Operation;
use super::state::{AdmissionFailure, AttemptMode, QueueStatus, Verdict};

/// Why a CI callback or request left the state untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No attempt is in flight.
    NoActiveAttempt,
    /// The build was for some other branch.
    OtherBranch { branch: String },
    /// The build was for an earlier attempt.
    StaleCallback,
    /// The event does not apply to the current state.
    UnexpectedEvent,
}

/// What reconciliation found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    InSync,
    /// An attempt was rebuilt from the integration branch.
    Adopted { pr_number: u64 },
    /// The integration branch exists without a recognizable marker.
    UnknownBranch,
    /// The local attempt was dropped because its branch is gone.
    Released { pr_number: u64 },
}

/// Why the state ended where it did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    Started { pr_number: u64, mode: AttemptMode },
    BranchConflict { active_pr: Option<u64> },
    Assigned { assignee: String },
    Finished { pr_number: u64, verdict: Verdict },
    /// CI reported something other than passed or failed.
    Inconclusive { status: String },
    Ignored(IgnoreReason),
    /// Admission gave up; nothing is left behind (or a leak was reported).
    Aborted(AdmissionFailure),
    /// A gateway call failed and the previous state was kept.
    OperationFailed { operation: Operation, error: String },
    Reconciled(ReconcileOutcome),
    NotACommand,
    MalformedCommand,
    UnrecognizedCommand { attempted: String },
    UnauthorizedSender { login: String },
    /// The repository worker could not be reached.
    WorkerUnavailable,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Started { pr_number, mode } => write!(f, "testing #{} ({})", pr_number, mode),
            Reason::BranchConflict { active_pr } => match active_pr {
                Some(pr) => write!(f, "#{} is already being tested", pr),
                None => write!(f, "integration branch already exists"),
            },
            Reason::Assigned { assignee } => write!(f, "assigned to {}", assignee),
            Reason::Finished { pr_number, verdict } => write!(f, "#{} {}", pr_number, verdict),
            Reason::Inconclusive { status } => write!(f, "inconclusive CI state `{}`", status),
            Reason::Ignored(IgnoreReason::NoActiveAttempt) => write!(f, "no attempt in flight"),
            Reason::Ignored(IgnoreReason::OtherBranch { branch }) => {
                write!(f, "not the integration branch: {}", branch)
            }
            Reason::Ignored(IgnoreReason::StaleCallback) => {
                write!(f, "callback for an earlier attempt")
            }
            Reason::Ignored(IgnoreReason::UnexpectedEvent) => write!(f, "event ignored"),
            Reason::Aborted(failure) => write!(f, "aborted: {}", failure),
            Reason::OperationFailed { operation, error } => {
                write!(f, "{} failed: {}", operation, error)
            }
            Reason::Reconciled(ReconcileOutcome::InSync) => write!(f, "in sync"),
            Reason::Reconciled(ReconcileOutcome::Adopted { pr_number }) => {
                write!(f, "adopted #{} from the integration branch", pr_number)
            }
            Reason::Reconciled(ReconcileOutcome::UnknownBranch) => {
                write!(f, "integration branch has no merge marker")
            }
            Reason::Reconciled(ReconcileOutcome::Released { pr_number }) => {
                write!(f, "released #{}: integration branch is gone", pr_number)
            }
            Reason::NotACommand => write!(f, "not a command"),
            Reason::MalformedCommand => write!(f, "malformed command"),
            Reason::UnrecognizedCommand { attempted } => {
                write!(f, "unrecognized command `{}`", attempted)
            }
            Reason::UnauthorizedSender { login } => write!(f, "{} is not a reviewer", login),
            Reason::WorkerUnavailable => write!(f, "repository worker unavailable"),
        }
    }
}

/// The result of one coordinator operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Repository state after the operation.
    pub status: QueueStatus,
    pub reason: Reason,
    /// Notices produced while processing, in order.
    pub notices: Vec<Notice>,
}

impl Resolution {
    /// A resolution that never reached the state machine.
    pub fn unchanged(status: QueueStatus, reason: Reason) -> Self {
        Self {
            status,
            reason,
            notices: Vec::new(),
        }
    }
}

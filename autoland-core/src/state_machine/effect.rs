//! Effects (side effects as data).
//!
//! Effects describe what should happen as a result of a state transition.
//! They are pure data; the interpreter executes gateway effects and the
//! worker hands notices to the notifier once the event has been processed.

use std::fmt;

use super::event::{CiStatus, Operation};
use super::state::{AdmissionFailure, AttemptMode, CommitSha, RepositoryKey, Verdict};

/// All effects that can be produced by state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    // =========================================================================
    // Integration branch (answered by a result event)
    // =========================================================================
    /// Look up the integration branch.
    ProbeIntegrationBranch,

    FetchPullRequest { pr_number: u64 },

    /// Look up the tip of the base branch.
    ResolveBaseHead { branch: String },

    CreateIntegrationBranch { from: CommitSha },

    MergeIntoIntegration { head_sha: CommitSha, message: String },

    MergeIntoBase {
        base_branch: String,
        head_sha: CommitSha,
        message: String,
    },

    DeleteIntegrationBranch,

    // =========================================================================
    // Best effort (answered only on failure)
    // =========================================================================
    /// Delete a landed pull request's head branch, possibly in a fork.
    DeleteSourceBranch {
        repository: RepositoryKey,
        branch: String,
    },

    /// Read the issue's labels, then write them back with `remove` taken
    /// out and `add` put in.
    UpdateLabels {
        issue_number: u64,
        remove: Vec<String>,
        add: Vec<String>,
    },

    AssignIssue {
        issue_number: u64,
        assignees: Vec<String>,
    },

    // =========================================================================
    // Outbound messages
    // =========================================================================
    /// Hand a notice to the notifier after the event is processed.
    Notify(Notice),

    /// Log a message (for debugging/tracing).
    Log { level: LogLevel, message: String },
}

impl Effect {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self::Log {
            level,
            message: message.into(),
        }
    }

    /// True for effects that never produce a success event.
    pub fn is_best_effort(&self) -> bool {
        matches!(
            self,
            Effect::DeleteSourceBranch { .. }
                | Effect::UpdateLabels { .. }
                | Effect::AssignIssue { .. }
        )
    }
}

/// Human-readable messages for requesters and operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    AttemptStarted {
        pr_number: u64,
        mode: AttemptMode,
        requested_by: String,
        head_sha: CommitSha,
    },

    /// A start request was rejected because the integration branch is taken.
    BranchConflict {
        pr_number: u64,
        /// The pull request holding the branch, when it can be told.
        active_pr: Option<u64>,
    },

    ReviewAssigned { pr_number: u64, assignee: String },

    AttemptFinished {
        pr_number: u64,
        mode: AttemptMode,
        verdict: Verdict,
    },

    /// CI reported a state that is neither `passed` nor `failed`.
    UnknownCiStatus {
        pr_number: u64,
        status: CiStatus,
        build_url: Option<String>,
    },

    AdmissionAborted {
        pr_number: u64,
        failure: AdmissionFailure,
    },

    /// A gateway call failed; the repository kept its previous state.
    OperationFailed {
        pr_number: Option<u64>,
        operation: Operation,
        error: String,
    },

    /// Rolling back a failed admission could not delete the branch.
    IntegrationBranchLeaked { pr_number: u64, error: String },

    /// The integration branch exists but was not created by this bot.
    UnknownIntegrationBranch { sha: CommitSha },

    /// The integration branch disappeared while an attempt was testing.
    IntegrationBranchLost { pr_number: u64 },

    /// An attempt was rebuilt from the integration branch after a restart.
    AttemptRecovered { pr_number: u64, mode: AttemptMode },

    /// A command from someone who is not a reviewer was ignored.
    UnauthorizedSender { pr_number: u64, login: String },

    /// The bot was mentioned with nothing after it.
    MalformedCommand { pr_number: u64 },

    UnrecognizedCommand { pr_number: u64, attempted: String },
}

impl Notice {
    /// The pull request this notice is about, if any.
    pub fn pr_number(&self) -> Option<u64> {
        match self {
            Notice::AttemptStarted { pr_number, .. }
            | Notice::BranchConflict { pr_number, .. }
            | Notice::ReviewAssigned { pr_number, .. }
            | Notice::AttemptFinished { pr_number, .. }
            | Notice::UnknownCiStatus { pr_number, .. }
            | Notice::AdmissionAborted { pr_number, .. }
            | Notice::IntegrationBranchLeaked { pr_number, .. }
            | Notice::IntegrationBranchLost { pr_number }
            | Notice::AttemptRecovered { pr_number, .. }
            | Notice::UnauthorizedSender { pr_number, .. }
            | Notice::MalformedCommand { pr_number }
            | Notice::UnrecognizedCommand { pr_number, .. } => Some(*pr_number),
            Notice::OperationFailed { pr_number, .. } => *pr_number,
            Notice::UnknownIntegrationBranch { .. } => None,
        }
    }

    /// True for notices that need someone to look at the repository.
    pub fn needs_operator(&self) -> bool {
        matches!(
            self,
            Notice::UnknownCiStatus { .. }
                | Notice::OperationFailed { .. }
                | Notice::IntegrationBranchLeaked { .. }
                | Notice::UnknownIntegrationBranch { .. }
                | Notice::IntegrationBranchLost { .. }
        )
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::AttemptStarted {
                pr_number,
                mode,
                requested_by,
                head_sha,
            } => write!(
                f,
                ":hourglass: Testing #{} at {} ({} by {})",
                pr_number,
                head_sha.short(),
                mode,
                requested_by
            ),
            Notice::BranchConflict {
                pr_number,
                active_pr,
            } => match active_pr {
                Some(active) => write!(
                    f,
                    ":lock: Cannot start #{}: #{} is already being tested",
                    pr_number, active
                ),
                None => write!(
                    f,
                    ":lock: Cannot start #{}: the integration branch is already in use",
                    pr_number
                ),
            },
            Notice::ReviewAssigned {
                pr_number,
                assignee,
            } => write!(f, ":eyes: #{} assigned to {} for review", pr_number, assignee),
            Notice::AttemptFinished {
                pr_number,
                mode,
                verdict,
            } => {
                let icon = if verdict.is_success() {
                    ":tada:"
                } else {
                    ":collision:"
                };
                write!(f, "{} #{} ({}): {}", icon, pr_number, mode, verdict)
            }
            Notice::UnknownCiStatus {
                pr_number,
                status,
                build_url,
            } => {
                write!(
                    f,
                    ":warning: CI reported `{}` for #{}; the attempt is still holding the integration branch",
                    status, pr_number
                )?;
                if let Some(url) = build_url {
                    write!(f, " ({})", url)?;
                }
                Ok(())
            }
            Notice::AdmissionAborted { pr_number, failure } => {
                write!(f, ":collision: Could not start #{}: {}", pr_number, failure)
            }
            Notice::OperationFailed {
                pr_number,
                operation,
                error,
            } => match pr_number {
                Some(pr) => write!(f, ":warning: #{}: {} failed: {}", pr, operation, error),
                None => write!(f, ":warning: {} failed: {}", operation, error),
            },
            Notice::IntegrationBranchLeaked { pr_number, error } => write!(
                f,
                ":warning: The integration branch left behind by #{} could not be deleted ({}); delete it by hand",
                pr_number, error
            ),
            Notice::UnknownIntegrationBranch { sha } => write!(
                f,
                ":warning: The integration branch exists at {} but was not created by this bot; delete it to unblock the queue",
                sha.short()
            ),
            Notice::IntegrationBranchLost { pr_number } => write!(
                f,
                ":warning: The integration branch for #{} disappeared; the attempt was dropped",
                pr_number
            ),
            Notice::AttemptRecovered { pr_number, mode } => write!(
                f,
                ":recycle: Resumed tracking #{} ({}) from the integration branch",
                pr_number, mode
            ),
            Notice::UnauthorizedSender { pr_number, login } => write!(
                f,
                ":no_entry: Ignoring the command on #{}: {} is not a reviewer",
                pr_number, login
            ),
            Notice::MalformedCommand { pr_number } => write!(
                f,
                ":question: Could not read the command on #{}; expected `try`, `r+` or `r?`",
                pr_number
            ),
            Notice::UnrecognizedCommand {
                pr_number,
                attempted,
            } => write!(
                f,
                ":question: Unknown command `{}` on #{}; expected `try`, `r+` or `r?`",
                attempted, pr_number
            ),
        }
    }
}

/// Log level for logging effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

//! Merge-queue coordinator.
//!
//! Comments on a pull request are parsed into commands, commands and CI
//! callbacks are fed into a per-repository state machine, and the state
//! machine acts on the outside world only through two ports: the
//! [`HostingGateway`] (branches, merges, labels) and the [`Notifier`].

pub mod command;
pub mod config;
pub mod coordinator;
pub mod gateway;
pub mod merge_message;
pub mod notifier;
pub mod state_machine;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use command::{parse_comment, Command, ParseResult};
pub use config::{QueueConfig, ReviewerSet};
pub use coordinator::{Coordinator, ReviewComment};
pub use gateway::{BranchHead, GatewayError, HostingGateway, IssueInfo, PullRequestInfo};
pub use notifier::{FanoutNotifier, LogNotifier, NoticeDispatcher, Notifier};
pub use state_machine::{
    AttemptMode, CiReport, CiStatus, CommitSha, IgnoreReason, IntegrationAttempt, Notice,
    QueueStatus, Reason, ReconcileOutcome, RepositoryKey, Resolution, Verdict,
};

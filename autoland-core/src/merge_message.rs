//! Integration commit messages.
//!
//! The merge commit on the integration branch carries enough information to
//! rebuild the attempt that created it:
//!
//! ```text
//! Auto merge of #42 (r+) by alice
//!
//! base-branch: main
//! base: 5d2c0f3e...
//! head: 9a81b7c4...
//! ```
//!
//! CI callbacks echo the message of the commit they built, which lets a
//! callback be matched to the attempt, and reconciliation reads it back off
//! the branch tip after a restart.

use crate::state_machine::state::{AttemptMode, CommitSha, IntegrationAttempt};

const SUBJECT_PREFIX: &str = "Auto merge of #";

/// The attempt description recovered from a commit message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeMarker {
    pub pr_number: u64,
    pub mode: AttemptMode,
    pub requested_by: String,
    pub base_branch: String,
    pub base_sha: CommitSha,
    pub head_sha: CommitSha,
}

impl MergeMarker {
    pub fn for_attempt(attempt: &IntegrationAttempt) -> Self {
        Self {
            pr_number: attempt.pr_number,
            mode: attempt.mode,
            requested_by: attempt.requested_by.clone(),
            base_branch: attempt.base_branch.clone(),
            base_sha: attempt.base_sha.clone(),
            head_sha: attempt.head_sha.clone(),
        }
    }

    /// Render the commit message.
    pub fn render(&self) -> String {
        format!(
            "{}{} ({}) by {}\n\nbase-branch: {}\nbase: {}\nhead: {}\n",
            SUBJECT_PREFIX,
            self.pr_number,
            self.mode.verb(),
            self.requested_by,
            self.base_branch,
            self.base_sha,
            self.head_sha
        )
    }

    /// Parse a commit message. Returns `None` unless the subject and all
    /// three trailer lines are present.
    pub fn parse(message: &str) -> Option<Self> {
        let mut lines = message.lines();
        let (pr_number, mode, requested_by) = parse_subject(lines.next()?)?;

        let mut base_branch = None;
        let mut base_sha = None;
        let mut head_sha = None;
        for line in lines {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                "base-branch" => base_branch = Some(value.to_string()),
                "base" => base_sha = Some(CommitSha::from(value)),
                "head" => head_sha = Some(CommitSha::from(value)),
                _ => {}
            }
        }

        Some(Self {
            pr_number,
            mode,
            requested_by,
            base_branch: base_branch?,
            base_sha: base_sha?,
            head_sha: head_sha?,
        })
    }

    /// Rebuild the attempt this marker describes.
    pub fn into_attempt(self, integration_sha: CommitSha) -> IntegrationAttempt {
        IntegrationAttempt {
            pr_number: self.pr_number,
            mode: self.mode,
            base_branch: self.base_branch,
            base_sha: self.base_sha,
            head_sha: self.head_sha,
            integration_sha: Some(integration_sha),
            requested_by: self.requested_by,
            landed_sha: None,
        }
    }
}

/// Pull request number named by a message's subject line, if it has one.
///
/// Lenient compared to [`MergeMarker::parse`]: CI providers sometimes
/// truncate the message to its first line.
pub fn pr_number_of(message: &str) -> Option<u64> {
    let subject = message.lines().next()?;
    parse_subject(subject).map(|(pr_number, _, _)| pr_number)
}

fn parse_subject(subject: &str) -> Option<(u64, AttemptMode, String)> {
    let rest = subject.trim().strip_prefix(SUBJECT_PREFIX)?;
    let (number, rest) = rest.split_once(' ')?;
    let pr_number = number.parse().ok()?;

    let rest = rest.strip_prefix('(')?;
    let (verb, rest) = rest.split_once(')')?;
    let mode = AttemptMode::from_verb(verb)?;

    let requested_by = rest.trim_start().strip_prefix("by ")?.trim();
    if requested_by.is_empty() {
        return None;
    }
    Some((pr_number, mode, requested_by.to_string()))
}

/// Message for the commit that lands an approved pull request.
pub fn landing_message(attempt: &IntegrationAttempt) -> String {
    format!(
        "Merge #{} (r+ by {})\n\nhead: {}\n",
        attempt.pr_number, attempt.requested_by, attempt.head_sha
    )
}

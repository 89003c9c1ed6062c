//! Immutable queue configuration.
//!
//! Built once at startup and shared by reference with every repository
//! worker; nothing in the transition logic reads ambient globals.

use std::collections::BTreeSet;
use std::time::Duration;

pub const DEFAULT_INTEGRATION_BRANCH: &str = "auto";
pub const DEFAULT_AWAITING_REVIEW_LABEL: &str = "S-awaiting-review";
pub const DEFAULT_AWAITING_MERGE_LABEL: &str = "S-awaiting-merge";
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(10);

/// Logins allowed to issue `try`, `r+` and `r?` commands.
///
/// Logins are stored without the leading `@` and compared
/// case-insensitively, matching how the hosting side treats them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewerSet {
    logins: BTreeSet<String>,
}

impl ReviewerSet {
    pub fn new<I, S>(logins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        logins.into_iter().collect()
    }

    /// True if `login` (with or without a leading `@`) is a reviewer.
    pub fn is_authorized(&self, login: &str) -> bool {
        self.logins.contains(&normalize_login(login))
    }

    /// True if `token` is an `@`-mention of a reviewer.
    ///
    /// Unlike [`is_authorized`](Self::is_authorized) the `@` is required.
    pub fn is_mention(&self, token: &str) -> bool {
        token
            .strip_prefix('@')
            .is_some_and(|login| self.is_authorized(login))
    }

    pub fn len(&self) -> usize {
        self.logins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.logins.iter().map(String::as_str)
    }
}

impl<S: AsRef<str>> FromIterator<S> for ReviewerSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self {
            logins: iter
                .into_iter()
                .map(|login| normalize_login(login.as_ref()))
                .filter(|login| !login.is_empty())
                .collect(),
        }
    }
}

/// Strip a leading `@` and lowercase.
pub fn normalize_login(login: &str) -> String {
    login.trim().trim_start_matches('@').to_ascii_lowercase()
}

/// Configuration shared by every repository queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// First word of a comment that addresses the bot, e.g. `@autoland`.
    pub bot_trigger: String,
    pub reviewers: ReviewerSet,
    /// Name of the branch whose existence is the per-repository lock.
    pub integration_branch: String,
    pub awaiting_review_label: String,
    pub awaiting_merge_label: String,
    /// Delete the pull request's head branch after it lands.
    pub delete_source_branch: bool,
    /// Upper bound on every hosting API call.
    pub api_timeout: Duration,
}

impl QueueConfig {
    pub fn new(bot_trigger: impl Into<String>, reviewers: ReviewerSet) -> Self {
        Self {
            bot_trigger: bot_trigger.into(),
            reviewers,
            integration_branch: DEFAULT_INTEGRATION_BRANCH.to_string(),
            awaiting_review_label: DEFAULT_AWAITING_REVIEW_LABEL.to_string(),
            awaiting_merge_label: DEFAULT_AWAITING_MERGE_LABEL.to_string(),
            delete_source_branch: true,
            api_timeout: DEFAULT_API_TIMEOUT,
        }
    }

    pub fn with_integration_branch(mut self, branch: impl Into<String>) -> Self {
        self.integration_branch = branch.into();
        self
    }

    pub fn with_labels(
        mut self,
        awaiting_review: impl Into<String>,
        awaiting_merge: impl Into<String>,
    ) -> Self {
        self.awaiting_review_label = awaiting_review.into();
        self.awaiting_merge_label = awaiting_merge.into();
        self
    }

    pub fn with_delete_source_branch(mut self, delete: bool) -> Self {
        self.delete_source_branch = delete;
        self
    }

    pub fn with_api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
    }
}

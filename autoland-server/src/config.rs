use std::env;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use autoland_core::config::{
    DEFAULT_API_TIMEOUT, DEFAULT_AWAITING_MERGE_LABEL, DEFAULT_AWAITING_REVIEW_LABEL,
    DEFAULT_INTEGRATION_BRANCH,
};
use autoland_core::{QueueConfig, RepositoryKey, ReviewerSet};

pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct Config {
    pub github_token: String,
    pub github_webhook_secret: String,
    pub github_api_url: String,
    pub bot_trigger: String,
    pub reviewers: ReviewerSet,
    pub integration_branch: String,
    pub awaiting_review_label: String,
    pub awaiting_merge_label: String,
    pub delete_source_branch: bool,
    pub api_timeout: Duration,
    pub slack_webhook_url: Option<String>,
    pub slack_channel: Option<String>,
    pub slack_username: Option<String>,
    /// Post notices as comments on the pull request they concern.
    pub comment_on_pull_requests: bool,
    /// If set, CI callbacks must carry it in the `Authorization` header.
    pub ci_callback_token: Option<String>,
    /// Bearer token for `/status` and `/reconcile`. If not set, those
    /// endpoints are disabled (403 Forbidden).
    pub admin_token: Option<String>,
    /// Repositories reconciled at startup.
    pub repositories: Vec<RepositoryKey>,
    /// Zero disables periodic reconciliation.
    pub reconcile_interval: Duration,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |name: &str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .with_context(|| format!("{} environment variable is required", name))
        };
        let optional = |name: &str| parse_secret(lookup(name));

        let github_token = required("GITHUB_TOKEN")?;
        let github_webhook_secret = required("GITHUB_WEBHOOK_SECRET")?;
        let bot_trigger = required("BOT_TRIGGER")?.trim().to_string();

        let reviewers = parse_reviewers(&required("REVIEWERS")?);
        if reviewers.is_empty() {
            return Err(anyhow!("REVIEWERS must name at least one login"));
        }

        let github_api_url = optional("GITHUB_API_URL")
            .unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_string());
        url::Url::parse(&github_api_url).context("GITHUB_API_URL must be a valid URL")?;

        let integration_branch = optional("INTEGRATION_BRANCH")
            .unwrap_or_else(|| DEFAULT_INTEGRATION_BRANCH.to_string());
        let awaiting_review_label = optional("AWAITING_REVIEW_LABEL")
            .unwrap_or_else(|| DEFAULT_AWAITING_REVIEW_LABEL.to_string());
        let awaiting_merge_label = optional("AWAITING_MERGE_LABEL")
            .unwrap_or_else(|| DEFAULT_AWAITING_MERGE_LABEL.to_string());

        let delete_source_branch = parse_flag(lookup("DELETE_SOURCE_BRANCH"), true)
            .context("DELETE_SOURCE_BRANCH must be true or false")?;
        let comment_on_pull_requests = parse_flag(lookup("COMMENT_ON_PULL_REQUESTS"), true)
            .context("COMMENT_ON_PULL_REQUESTS must be true or false")?;

        let api_timeout = match optional("API_TIMEOUT_SECS") {
            Some(value) => {
                let secs = value
                    .trim()
                    .parse::<u64>()
                    .context("API_TIMEOUT_SECS must be a valid number")?;
                if secs == 0 {
                    return Err(anyhow!("API_TIMEOUT_SECS must be positive"));
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_API_TIMEOUT,
        };

        let reconcile_interval = match optional("RECONCILE_INTERVAL_SECS") {
            Some(value) => Duration::from_secs(
                value
                    .trim()
                    .parse::<u64>()
                    .context("RECONCILE_INTERVAL_SECS must be a valid number")?,
            ),
            None => DEFAULT_RECONCILE_INTERVAL,
        };

        let repositories = match optional("REPOSITORIES") {
            Some(value) => parse_repositories(&value)?,
            None => Vec::new(),
        };

        let port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        Ok(Config {
            github_token,
            github_webhook_secret,
            github_api_url,
            bot_trigger,
            reviewers,
            integration_branch,
            awaiting_review_label,
            awaiting_merge_label,
            delete_source_branch,
            api_timeout,
            slack_webhook_url: optional("SLACK_WEBHOOK_URL"),
            slack_channel: optional("SLACK_CHANNEL"),
            slack_username: optional("SLACK_USERNAME"),
            comment_on_pull_requests,
            ci_callback_token: optional("CI_CALLBACK_TOKEN"),
            admin_token: optional("ADMIN_TOKEN"),
            repositories,
            reconcile_interval,
            port,
        })
    }

    /// The immutable configuration handed to the coordinator.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::new(self.bot_trigger.clone(), self.reviewers.clone())
            .with_integration_branch(self.integration_branch.clone())
            .with_labels(
                self.awaiting_review_label.clone(),
                self.awaiting_merge_label.clone(),
            )
            .with_delete_source_branch(self.delete_source_branch)
            .with_api_timeout(self.api_timeout)
    }
}

/// Treat missing, empty and whitespace-only values as unset, so an empty
/// token never grants access.
pub fn parse_secret(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Reviewer logins separated by commas or whitespace.
pub fn parse_reviewers(value: &str) -> ReviewerSet {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|login| !login.is_empty())
        .collect()
}

/// Comma-separated `owner/name` list.
pub fn parse_repositories(value: &str) -> Result<Vec<RepositoryKey>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            RepositoryKey::parse(entry)
                .with_context(|| format!("REPOSITORIES entry `{}` is not owner/name", entry))
        })
        .collect()
}

fn parse_flag(value: Option<String>, default: bool) -> Result<bool> {
    match parse_secret(value) {
        Some(value) => value
            .trim()
            .to_ascii_lowercase()
            .parse::<bool>()
            .map_err(|e| anyhow!(e)),
        None => Ok(default),
    }
}

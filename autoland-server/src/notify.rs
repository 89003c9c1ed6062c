//! Notification sinks backed by Slack and pull request comments.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use autoland_core::{HostingGateway, Notice, Notifier, RepositoryKey};
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::Serialize;
use tracing::debug;

use crate::http_log::LoggingMiddleware;

/// Posts notices to a Slack incoming webhook.
pub struct SlackNotifier {
    client: ClientWithMiddleware,
    webhook_url: String,
    channel: Option<String>,
    username: Option<String>,
}

#[derive(Debug, Serialize)]
struct SlackMessage<'a> {
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
}

impl SlackNotifier {
    pub fn new(
        webhook_url: impl Into<String>,
        channel: Option<String>,
        username: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create Slack HTTP client")?;
        Ok(Self {
            client: ClientBuilder::new(client)
                .with(LoggingMiddleware::new("slack"))
                .build(),
            webhook_url: webhook_url.into(),
            channel,
            username,
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, repository: &RepositoryKey, notice: &Notice) -> Result<()> {
        let message = SlackMessage {
            text: format!("[{}] {}", repository, notice),
            channel: self.channel.as_deref(),
            username: self.username.as_deref(),
        };

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&message)
            .send()
            .await
            .context("Failed to send Slack notification")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Slack webhook returned {}: {}", status, body));
        }
        Ok(())
    }
}

/// Comments on the pull request a notice is about. Notices that name no
/// pull request are skipped.
pub struct PullRequestCommentNotifier {
    gateway: Arc<dyn HostingGateway>,
    version: String,
}

impl PullRequestCommentNotifier {
    pub fn new(gateway: Arc<dyn HostingGateway>, version: impl Into<String>) -> Self {
        Self {
            gateway,
            version: version.into(),
        }
    }

    fn render(&self, notice: &Notice) -> String {
        format!("{}\n\n<sub>autoland {}</sub>", notice, self.version)
    }
}

#[async_trait]
impl Notifier for PullRequestCommentNotifier {
    async fn notify(&self, repository: &RepositoryKey, notice: &Notice) -> Result<()> {
        let Some(pr_number) = notice.pr_number() else {
            debug!("Notice for {} names no pull request; not commenting", repository);
            return Ok(());
        };

        self.gateway
            .comment(repository, pr_number, &self.render(notice))
            .await
            .with_context(|| format!("Failed to comment on {}#{}", repository, pr_number))
    }
}

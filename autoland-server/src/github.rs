//! GitHub REST implementation of the hosting gateway.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use autoland_core::gateway::GatewayResult;
use autoland_core::{
    BranchHead, CommitSha, GatewayError, HostingGateway, IssueInfo, PullRequestInfo,
    RepositoryKey,
};
use reqwest::{Client, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::http_log::LoggingMiddleware;

const ACCEPT: &str = "application/vnd.github+json";

#[derive(Clone)]
pub struct GitHubClient {
    client: ClientWithMiddleware,
    api_url: Url,
    token: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    number: u64,
    state: String,
    head: PullRequestRefResponse,
    base: PullRequestRefResponse,
}

#[derive(Debug, Deserialize)]
struct PullRequestRefResponse {
    sha: String,
    #[serde(rename = "ref")]
    ref_name: String,
    /// Null when the fork has been deleted.
    repo: Option<RepositoryResponse>,
}

#[derive(Debug, Deserialize)]
struct RepositoryResponse {
    name: String,
    owner: OwnerResponse,
}

#[derive(Debug, Deserialize)]
struct OwnerResponse {
    login: String,
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    #[serde(default)]
    labels: Vec<LabelResponse>,
}

#[derive(Debug, Deserialize)]
struct LabelResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct BranchResponse {
    commit: BranchCommitResponse,
}

#[derive(Debug, Deserialize)]
struct BranchCommitResponse {
    sha: String,
    commit: CommitDetailResponse,
}

#[derive(Debug, Deserialize)]
struct CommitDetailResponse {
    message: String,
}

#[derive(Debug, Deserialize)]
struct MergeResponse {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
}

#[derive(Debug, Serialize)]
struct CreateRefRequest<'a> {
    #[serde(rename = "ref")]
    ref_name: String,
    sha: &'a str,
}

#[derive(Debug, Serialize)]
struct MergeRequest<'a> {
    base: &'a str,
    head: &'a str,
    commit_message: &'a str,
}

#[derive(Debug, Serialize)]
struct SetLabelsRequest<'a> {
    labels: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct AssigneesRequest<'a> {
    assignees: &'a [String],
}

#[derive(Debug, Serialize)]
struct CreateCommentRequest<'a> {
    body: &'a str,
}

impl GitHubClient {
    pub fn new(token: impl Into<String>, api_url: &str, timeout: Duration) -> Result<Self> {
        let api_url = Url::parse(api_url).context("Invalid GitHub API URL")?;
        if api_url.cannot_be_a_base() {
            anyhow::bail!("GitHub API URL cannot be a base: {}", api_url);
        }
        Ok(Self {
            client: create_github_client(timeout)?,
            api_url,
            token: token.into(),
            timeout,
        })
    }

    /// `api_url` + `repos/{owner}/{name}` + `segments`. A segment holding
    /// slashes (a branch name) becomes several path segments.
    fn repo_url(&self, repo: &RepositoryKey, segments: &[&str]) -> Url {
        let mut url = self.api_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend(["repos", repo.owner.as_str(), repo.name.as_str()])
                .extend(segments.iter().flat_map(|segment| segment.split('/')));
        }
        url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", ACCEPT)
    }

    async fn send(&self, request: RequestBuilder) -> GatewayResult<reqwest::Response> {
        self.authorized(request)
            .send()
            .await
            .map_err(|e| self.request_error(e))
    }

    fn request_error(&self, error: reqwest_middleware::Error) -> GatewayError {
        match &error {
            reqwest_middleware::Error::Reqwest(e) if e.is_timeout() => {
                GatewayError::Timeout(self.timeout)
            }
            _ => GatewayError::Transient(format!("request failed: {}", error)),
        }
    }

    async fn json<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> GatewayResult<T> {
        response.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(self.timeout)
            } else {
                GatewayError::Transient(format!("unexpected response: {}", e))
            }
        })
    }
}

/// Status and message of a non-success response.
async fn failure(response: reqwest::Response) -> (StatusCode, String) {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&text)
        .map(|body| body.message)
        .unwrap_or(text);
    (status, message)
}

/// Map an unsuccessful status onto the gateway's error kinds.
fn classify(status: StatusCode, message: String) -> GatewayError {
    match status {
        StatusCode::NOT_FOUND => GatewayError::NotFound,
        StatusCode::CONFLICT => GatewayError::Conflict(message),
        _ => GatewayError::Transient(format!("GitHub API error {}: {}", status, message)),
    }
}

#[async_trait]
impl HostingGateway for GitHubClient {
    async fn get_pull_request(
        &self,
        repo: &RepositoryKey,
        number: u64,
    ) -> GatewayResult<PullRequestInfo> {
        let url = self.repo_url(repo, &["pulls", &number.to_string()]);
        let response = self.send(self.client.get(url)).await?;
        if !response.status().is_success() {
            let (status, message) = failure(response).await;
            return Err(classify(status, message));
        }

        let pr: PullRequestResponse = self.json(response).await?;
        let (head_owner, head_repo) = match pr.head.repo {
            Some(repo) => (Some(repo.owner.login), Some(repo.name)),
            None => (None, None),
        };
        Ok(PullRequestInfo {
            number: pr.number,
            head_sha: CommitSha(pr.head.sha),
            head_owner,
            head_repo,
            head_branch: pr.head.ref_name,
            base_branch: pr.base.ref_name,
            open: pr.state == "open",
        })
    }

    async fn get_issue(&self, repo: &RepositoryKey, number: u64) -> GatewayResult<IssueInfo> {
        let url = self.repo_url(repo, &["issues", &number.to_string()]);
        let response = self.send(self.client.get(url)).await?;
        if !response.status().is_success() {
            let (status, message) = failure(response).await;
            return Err(classify(status, message));
        }

        let issue: IssueResponse = self.json(response).await?;
        Ok(IssueInfo {
            labels: issue.labels.into_iter().map(|label| label.name).collect(),
        })
    }

    async fn get_branch(
        &self,
        repo: &RepositoryKey,
        name: &str,
    ) -> GatewayResult<Option<BranchHead>> {
        let url = self.repo_url(repo, &["branches", name]);
        let response = self.send(self.client.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let (status, message) = failure(response).await;
            return Err(classify(status, message));
        }

        let branch: BranchResponse = self.json(response).await?;
        Ok(Some(BranchHead {
            sha: CommitSha(branch.commit.sha),
            message: branch.commit.commit.message,
        }))
    }

    async fn create_branch(
        &self,
        repo: &RepositoryKey,
        name: &str,
        from: &CommitSha,
    ) -> GatewayResult<()> {
        info!("Creating branch {} at {} in {}", name, from.short(), repo);

        let url = self.repo_url(repo, &["git", "refs"]);
        let body = CreateRefRequest {
            ref_name: format!("refs/heads/{}", name),
            sha: &from.0,
        };
        let response = self.send(self.client.post(url).json(&body)).await?;
        if response.status().is_success() {
            return Ok(());
        }

        match failure(response).await {
            (StatusCode::UNPROCESSABLE_ENTITY, message)
                if message.to_ascii_lowercase().contains("already exists") =>
            {
                Err(GatewayError::AlreadyExists)
            }
            (status, message) => Err(classify(status, message)),
        }
    }

    async fn delete_branch(&self, repo: &RepositoryKey, name: &str) -> GatewayResult<()> {
        info!("Deleting branch {} in {}", name, repo);

        let url = self.repo_url(repo, &["git", "refs", "heads", name]);
        let response = self.send(self.client.delete(url)).await?;
        if response.status().is_success() {
            return Ok(());
        }

        match failure(response).await {
            // "Reference does not exist"
            (StatusCode::UNPROCESSABLE_ENTITY, _) => Err(GatewayError::NotFound),
            (status, message) => Err(classify(status, message)),
        }
    }

    async fn merge(
        &self,
        repo: &RepositoryKey,
        target: &str,
        source: &CommitSha,
        message: &str,
    ) -> GatewayResult<CommitSha> {
        info!("Merging {} into {} in {}", source.short(), target, repo);

        let url = self.repo_url(repo, &["merges"]);
        let body = MergeRequest {
            base: target,
            head: &source.0,
            commit_message: message,
        };
        let response = self.send(self.client.post(url).json(&body)).await?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => {
                let merged: MergeResponse = self.json(response).await?;
                Ok(CommitSha(merged.sha))
            }
            // Already merged: the target tip is the result.
            StatusCode::NO_CONTENT => match self.get_branch(repo, target).await? {
                Some(head) => Ok(head.sha),
                None => Err(GatewayError::NotFound),
            },
            _ => {
                let (status, message) = failure(response).await;
                Err(classify(status, message))
            }
        }
    }

    async fn set_labels(
        &self,
        repo: &RepositoryKey,
        number: u64,
        labels: &BTreeSet<String>,
    ) -> GatewayResult<()> {
        let url = self.repo_url(repo, &["issues", &number.to_string(), "labels"]);
        let body = SetLabelsRequest {
            labels: labels.iter().map(String::as_str).collect(),
        };
        let response = self.send(self.client.put(url).json(&body)).await?;
        if !response.status().is_success() {
            let (status, message) = failure(response).await;
            return Err(classify(status, message));
        }
        Ok(())
    }

    async fn assign(
        &self,
        repo: &RepositoryKey,
        number: u64,
        logins: &[String],
    ) -> GatewayResult<()> {
        let url = self.repo_url(repo, &["issues", &number.to_string(), "assignees"]);
        let body = AssigneesRequest { assignees: logins };
        let response = self.send(self.client.post(url).json(&body)).await?;
        if !response.status().is_success() {
            let (status, message) = failure(response).await;
            return Err(classify(status, message));
        }
        Ok(())
    }

    async fn comment(&self, repo: &RepositoryKey, number: u64, body: &str) -> GatewayResult<()> {
        info!("Posting comment to #{} in {}", number, repo);

        let url = self.repo_url(repo, &["issues", &number.to_string(), "comments"]);
        let body = CreateCommentRequest { body };
        let response = self.send(self.client.post(url).json(&body)).await?;
        if !response.status().is_success() {
            let (status, message) = failure(response).await;
            warn!("Failed to comment on #{} in {}: {}", number, repo, message);
            return Err(classify(status, message));
        }
        Ok(())
    }
}

pub fn create_github_client(timeout: Duration) -> Result<ClientWithMiddleware> {
    let client = Client::builder()
        .user_agent(concat!("autoland/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .context("Failed to create HTTP client")?;

    Ok(ClientBuilder::new(client)
        .with(LoggingMiddleware::new("github"))
        .build())
}

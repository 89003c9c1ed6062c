//! In-memory hosting service for tests.
//!
//! [`FakeHost`] keeps branches, pull requests, labels, assignees and comments
//! per repository, records every call, and can be told to fail or hang on
//! the next call of a given kind.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::gateway::{
    BranchHead, GatewayError, GatewayResult, HostingGateway, IssueInfo, PullRequestInfo,
};
use crate::state_machine::state::{CommitSha, RepositoryKey};

/// Kinds of gateway call, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    GetPullRequest,
    GetIssue,
    GetBranch,
    CreateBranch,
    DeleteBranch,
    Merge,
    SetLabels,
    Assign,
    Comment,
}

/// A recorded gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    GetPullRequest {
        repo: RepositoryKey,
        number: u64,
    },
    GetIssue {
        repo: RepositoryKey,
        number: u64,
    },
    GetBranch {
        repo: RepositoryKey,
        name: String,
    },
    CreateBranch {
        repo: RepositoryKey,
        name: String,
        from: CommitSha,
    },
    DeleteBranch {
        repo: RepositoryKey,
        name: String,
    },
    Merge {
        repo: RepositoryKey,
        target: String,
        source: CommitSha,
    },
    SetLabels {
        repo: RepositoryKey,
        number: u64,
        labels: BTreeSet<String>,
    },
    Assign {
        repo: RepositoryKey,
        number: u64,
        logins: Vec<String>,
    },
    Comment {
        repo: RepositoryKey,
        number: u64,
        body: String,
    },
}

impl Call {
    /// True for calls that change something on the host.
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Call::GetPullRequest { .. } | Call::GetIssue { .. } | Call::GetBranch { .. }
        )
    }

    pub fn repo(&self) -> &RepositoryKey {
        match self {
            Call::GetPullRequest { repo, .. }
            | Call::GetIssue { repo, .. }
            | Call::GetBranch { repo, .. }
            | Call::CreateBranch { repo, .. }
            | Call::DeleteBranch { repo, .. }
            | Call::Merge { repo, .. }
            | Call::SetLabels { repo, .. }
            | Call::Assign { repo, .. }
            | Call::Comment { repo, .. } => repo,
        }
    }
}

/// A branch that was successfully created or deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchChange {
    Created { repo: RepositoryKey, name: String },
    Deleted { repo: RepositoryKey, name: String },
}

#[derive(Default)]
struct Inner {
    branches: HashMap<(RepositoryKey, String), BranchHead>,
    pull_requests: HashMap<(RepositoryKey, u64), PullRequestInfo>,
    labels: HashMap<(RepositoryKey, u64), BTreeSet<String>>,
    assignees: HashMap<(RepositoryKey, u64), Vec<String>>,
    comments: Vec<(RepositoryKey, u64, String)>,
    calls: Vec<Call>,
    history: Vec<BranchChange>,
    failures: HashMap<FakeOp, VecDeque<GatewayError>>,
    hanging: HashSet<FakeOp>,
    conflicting: HashSet<CommitSha>,
    next_commit: u64,
}

/// In-memory [`HostingGateway`].
#[derive(Default)]
pub struct FakeHost {
    inner: Mutex<Inner>,
}

/// A pull request from `repo` itself, head branch `pr-<number>` onto `main`.
pub fn pull_request(repo: &RepositoryKey, number: u64, head_sha: &str) -> PullRequestInfo {
    PullRequestInfo {
        number,
        head_sha: CommitSha::from(head_sha),
        head_owner: Some(repo.owner.clone()),
        head_repo: Some(repo.name.clone()),
        head_branch: format!("pr-{}", number),
        base_branch: "main".to_string(),
        open: true,
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Setup
    // =========================================================================

    pub fn add_branch(&self, repo: &RepositoryKey, name: &str, sha: &str, message: &str) {
        self.lock().branches.insert(
            (repo.clone(), name.to_string()),
            BranchHead {
                sha: CommitSha::from(sha),
                message: message.to_string(),
            },
        );
    }

    /// Add a pull request together with its head branch and `main`.
    pub fn add_pull_request(&self, repo: &RepositoryKey, pr: PullRequestInfo) {
        let mut inner = self.lock();
        inner
            .branches
            .entry((repo.clone(), pr.base_branch.clone()))
            .or_insert_with(|| BranchHead {
                sha: CommitSha::from("base000"),
                message: "Initial commit".to_string(),
            });
        inner.branches.insert(
            (repo.clone(), pr.head_branch.clone()),
            BranchHead {
                sha: pr.head_sha.clone(),
                message: format!("Work on #{}", pr.number),
            },
        );
        inner.pull_requests.insert((repo.clone(), pr.number), pr);
    }

    /// Replace a pull request, e.g. to simulate a push or a close.
    pub fn update_pull_request(&self, repo: &RepositoryKey, pr: PullRequestInfo) {
        self.lock().pull_requests.insert((repo.clone(), pr.number), pr);
    }

    pub fn put_labels(&self, repo: &RepositoryKey, number: u64, labels: &[&str]) {
        self.lock().labels.insert(
            (repo.clone(), number),
            labels.iter().map(|label| label.to_string()).collect(),
        );
    }

    /// Fail the next call of kind `op` with `error`. Queued errors are used
    /// in order.
    pub fn fail_next(&self, op: FakeOp, error: GatewayError) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    /// Make every call of kind `op` hang for an hour.
    pub fn hang(&self, op: FakeOp) {
        self.lock().hanging.insert(op);
    }

    pub fn unhang(&self, op: FakeOp) {
        self.lock().hanging.remove(&op);
    }

    /// Merging `sha` anywhere reports a conflict.
    pub fn conflict_on(&self, sha: &str) {
        self.lock().conflicting.insert(CommitSha::from(sha));
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn branch(&self, repo: &RepositoryKey, name: &str) -> Option<BranchHead> {
        self.lock()
            .branches
            .get(&(repo.clone(), name.to_string()))
            .cloned()
    }

    pub fn labels(&self, repo: &RepositoryKey, number: u64) -> BTreeSet<String> {
        self.lock()
            .labels
            .get(&(repo.clone(), number))
            .cloned()
            .unwrap_or_default()
    }

    pub fn assignees(&self, repo: &RepositoryKey, number: u64) -> Vec<String> {
        self.lock()
            .assignees
            .get(&(repo.clone(), number))
            .cloned()
            .unwrap_or_default()
    }

    pub fn comments(&self) -> Vec<(RepositoryKey, u64, String)> {
        self.lock().comments.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Calls that targeted `repo`.
    pub fn calls_for(&self, repo: &RepositoryKey) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.repo() == repo)
            .cloned()
            .collect()
    }

    /// Successful branch creations and deletions, in order.
    pub fn branch_history(&self) -> Vec<BranchChange> {
        self.lock().history.clone()
    }

    /// Merges whose target was `target`.
    pub fn merges_into(&self, repo: &RepositoryKey, target: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| {
                matches!(call, Call::Merge { repo: r, target: t, .. } if r == repo && t == target)
            })
            .count()
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    /// Record the call, then apply injected hangs and failures.
    async fn enter(&self, op: FakeOp, call: Call) -> GatewayResult<()> {
        let (hang, failure) = {
            let mut inner = self.lock();
            inner.calls.push(call);
            let failure = inner.failures.get_mut(&op).and_then(VecDeque::pop_front);
            (inner.hanging.contains(&op), failure)
        };
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl HostingGateway for FakeHost {
    async fn get_pull_request(
        &self,
        repo: &RepositoryKey,
        number: u64,
    ) -> GatewayResult<PullRequestInfo> {
        self.enter(
            FakeOp::GetPullRequest,
            Call::GetPullRequest {
                repo: repo.clone(),
                number,
            },
        )
        .await?;
        self.lock()
            .pull_requests
            .get(&(repo.clone(), number))
            .cloned()
            .ok_or(GatewayError::NotFound)
    }

    async fn get_issue(&self, repo: &RepositoryKey, number: u64) -> GatewayResult<IssueInfo> {
        self.enter(
            FakeOp::GetIssue,
            Call::GetIssue {
                repo: repo.clone(),
                number,
            },
        )
        .await?;
        Ok(IssueInfo {
            labels: self.labels(repo, number),
        })
    }

    async fn get_branch(
        &self,
        repo: &RepositoryKey,
        name: &str,
    ) -> GatewayResult<Option<BranchHead>> {
        self.enter(
            FakeOp::GetBranch,
            Call::GetBranch {
                repo: repo.clone(),
                name: name.to_string(),
            },
        )
        .await?;
        Ok(self.branch(repo, name))
    }

    async fn create_branch(
        &self,
        repo: &RepositoryKey,
        name: &str,
        from: &CommitSha,
    ) -> GatewayResult<()> {
        self.enter(
            FakeOp::CreateBranch,
            Call::CreateBranch {
                repo: repo.clone(),
                name: name.to_string(),
                from: from.clone(),
            },
        )
        .await?;
        let mut inner = self.lock();
        let key = (repo.clone(), name.to_string());
        if inner.branches.contains_key(&key) {
            return Err(GatewayError::AlreadyExists);
        }
        inner.branches.insert(
            key,
            BranchHead {
                sha: from.clone(),
                message: String::new(),
            },
        );
        inner.history.push(BranchChange::Created {
            repo: repo.clone(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn delete_branch(&self, repo: &RepositoryKey, name: &str) -> GatewayResult<()> {
        self.enter(
            FakeOp::DeleteBranch,
            Call::DeleteBranch {
                repo: repo.clone(),
                name: name.to_string(),
            },
        )
        .await?;
        let mut inner = self.lock();
        if inner
            .branches
            .remove(&(repo.clone(), name.to_string()))
            .is_none()
        {
            return Err(GatewayError::NotFound);
        }
        inner.history.push(BranchChange::Deleted {
            repo: repo.clone(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn merge(
        &self,
        repo: &RepositoryKey,
        target: &str,
        source: &CommitSha,
        message: &str,
    ) -> GatewayResult<CommitSha> {
        self.enter(
            FakeOp::Merge,
            Call::Merge {
                repo: repo.clone(),
                target: target.to_string(),
                source: source.clone(),
            },
        )
        .await?;
        let mut inner = self.lock();
        if inner.conflicting.contains(source) {
            return Err(GatewayError::Conflict("Merge conflict".to_string()));
        }
        let key = (repo.clone(), target.to_string());
        if !inner.branches.contains_key(&key) {
            return Err(GatewayError::NotFound);
        }
        inner.next_commit += 1;
        let sha = CommitSha::from(format!("merge-{}", inner.next_commit));
        inner.branches.insert(
            key,
            BranchHead {
                sha: sha.clone(),
                message: message.to_string(),
            },
        );
        Ok(sha)
    }

    async fn set_labels(
        &self,
        repo: &RepositoryKey,
        number: u64,
        labels: &BTreeSet<String>,
    ) -> GatewayResult<()> {
        self.enter(
            FakeOp::SetLabels,
            Call::SetLabels {
                repo: repo.clone(),
                number,
                labels: labels.clone(),
            },
        )
        .await?;
        self.lock()
            .labels
            .insert((repo.clone(), number), labels.clone());
        Ok(())
    }

    async fn assign(
        &self,
        repo: &RepositoryKey,
        number: u64,
        logins: &[String],
    ) -> GatewayResult<()> {
        self.enter(
            FakeOp::Assign,
            Call::Assign {
                repo: repo.clone(),
                number,
                logins: logins.to_vec(),
            },
        )
        .await?;
        let mut inner = self.lock();
        let assignees = inner.assignees.entry((repo.clone(), number)).or_default();
        for login in logins {
            if !assignees.contains(login) {
                assignees.push(login.clone());
            }
        }
        Ok(())
    }

    async fn comment(&self, repo: &RepositoryKey, number: u64, body: &str) -> GatewayResult<()> {
        self.enter(
            FakeOp::Comment,
            Call::Comment {
                repo: repo.clone(),
                number,
                body: body.to_string(),
            },
        )
        .await?;
        self.lock()
            .comments
            .push((repo.clone(), number, body.to_string()));
        Ok(())
    }
}

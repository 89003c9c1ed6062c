//! The public face of the merge queue.
//!
//! A [`Coordinator`] owns one worker task per repository, spawned lazily on
//! first use. Every operation is enqueued on the repository's worker before
//! the returned future is first polled, so operations on one repository are
//! applied in the order they were submitted, and operations on different
//! repositories run in parallel.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn, Span};

use crate::command::{parse_comment, Command, ParseResult};
use crate::config::QueueConfig;
use crate::gateway::HostingGateway;
use crate::notifier::{NoticeDispatcher, Notifier};
use crate::state_machine::effect::Notice;
use crate::state_machine::event::{start_requested, CiReport, Event};
use crate::state_machine::outcome::{Reason, Resolution};
use crate::state_machine::state::{AttemptMode, QueueStatus, RepositoryKey};
use crate::state_machine::worker::{Job, Worker};

#[cfg(test)]
mod properties;

/// A comment left on a pull request or issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewComment {
    pub repository: RepositoryKey,
    pub issue_number: u64,
    /// Login of the comment's author.
    pub sender: String,
    pub body: String,
}

pub struct Coordinator {
    config: Arc<QueueConfig>,
    gateway: Arc<dyn HostingGateway>,
    notices: NoticeDispatcher,
    workers: Mutex<HashMap<RepositoryKey, mpsc::UnboundedSender<Job>>>,
}

impl Coordinator {
    /// Create a coordinator. Must be called inside a tokio runtime.
    pub fn new(
        config: QueueConfig,
        gateway: Arc<dyn HostingGateway>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            gateway,
            notices: NoticeDispatcher::spawn(notifier),
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Parse a comment and act on it.
    ///
    /// Non-commands and rejected commands never reach the state machine;
    /// rejections are still reported through the notifier.
    pub async fn handle_comment(&self, comment: ReviewComment) -> Resolution {
        let ReviewComment {
            repository,
            issue_number,
            sender,
            body,
        } = comment;

        let command = match parse_comment(&body, &self.config.reviewers, &self.config.bot_trigger)
        {
            ParseResult::NotACommand => {
                return self.unchanged(&repository, Reason::NotACommand).await
            }
            ParseResult::Malformed => {
                let notice = Notice::MalformedCommand {
                    pr_number: issue_number,
                };
                return self
                    .rejected(&repository, Reason::MalformedCommand, notice)
                    .await;
            }
            ParseResult::Unrecognized { attempted } => {
                info!("Unrecognized command `{}` on {}#{}", attempted, repository, issue_number);
                let notice = Notice::UnrecognizedCommand {
                    pr_number: issue_number,
                    attempted: attempted.clone(),
                };
                return self
                    .rejected(&repository, Reason::UnrecognizedCommand { attempted }, notice)
                    .await;
            }
            ParseResult::Command(command) => command,
        };

        if !self.config.reviewers.is_authorized(&sender) {
            info!(
                "Ignoring `{}` on {}#{} from non-reviewer {}",
                command, repository, issue_number, sender
            );
            let notice = Notice::UnauthorizedSender {
                pr_number: issue_number,
                login: sender.clone(),
            };
            return self
                .rejected(&repository, Reason::UnauthorizedSender { login: sender }, notice)
                .await;
        }

        let sender = sender.trim_start_matches('@');
        match command {
            Command::StartAttempt(mode) => {
                self.start_attempt(&repository, issue_number, mode, sender)
                    .await
            }
            Command::AssignReview { reviewer, target } => {
                let assignee = target.unwrap_or(reviewer);
                let assignee = assignee.trim_start_matches('@');
                self.assign_review(&repository, issue_number, assignee)
                    .await
            }
        }
    }

    /// Admit a new integration attempt, or report why it was rejected.
    ///
    /// The caller is responsible for checking that `requested_by` is a
    /// reviewer.
    pub fn start_attempt(
        &self,
        repository: &RepositoryKey,
        pr_number: u64,
        mode: AttemptMode,
        requested_by: &str,
    ) -> impl Future<Output = Resolution> + Send + 'static {
        self.submit(repository, start_requested(pr_number, mode, requested_by))
    }

    /// Assign a pull request for review. Never changes the queue state.
    pub fn assign_review(
        &self,
        repository: &RepositoryKey,
        pr_number: u64,
        assignee: &str,
    ) -> impl Future<Output = Resolution> + Send + 'static {
        self.submit(
            repository,
            Event::ReviewAssignmentRequested {
                pr_number,
                assignee: assignee.to_string(),
            },
        )
    }

    /// Apply a CI callback.
    pub fn ci_report(
        &self,
        repository: &RepositoryKey,
        report: CiReport,
    ) -> impl Future<Output = Resolution> + Send + 'static {
        self.submit(repository, Event::CiReported(report))
    }

    /// Compare local state with the remote integration branch.
    pub fn reconcile(
        &self,
        repository: &RepositoryKey,
    ) -> impl Future<Output = Resolution> + Send + 'static {
        self.submit(repository, Event::ReconcileRequested)
    }

    /// Current state of a repository. Unknown repositories are idle.
    pub async fn status(&self, repository: &RepositoryKey) -> QueueStatus {
        let known = self.lock_workers().contains_key(repository);
        if !known {
            return QueueStatus::Idle;
        }
        let (reply, response) = oneshot::channel();
        if !self.enqueue(repository, Job::Status { reply }) {
            return QueueStatus::Idle;
        }
        response.await.unwrap_or_else(|_| {
            warn!("Worker for {} dropped a status query", repository);
            QueueStatus::Idle
        })
    }

    /// Status of every repository seen so far, ordered by repository.
    pub async fn snapshot(&self) -> Vec<(RepositoryKey, QueueStatus)> {
        let mut snapshot = Vec::new();
        for repository in self.known_repositories() {
            let status = self.status(&repository).await;
            snapshot.push((repository, status));
        }
        snapshot
    }

    /// Repositories that have a worker, in order.
    pub fn known_repositories(&self) -> Vec<RepositoryKey> {
        let mut repositories: Vec<_> = self.lock_workers().keys().cloned().collect();
        repositories.sort();
        repositories
    }

    // =========================================================================
    // Worker registry
    // =========================================================================

    async fn unchanged(&self, repository: &RepositoryKey, reason: Reason) -> Resolution {
        Resolution::unchanged(self.status(repository).await, reason)
    }

    /// A command turned away before reaching the state machine. The
    /// requester still hears about it.
    async fn rejected(
        &self,
        repository: &RepositoryKey,
        reason: Reason,
        notice: Notice,
    ) -> Resolution {
        self.notices.dispatch(repository.clone(), notice.clone());
        let mut resolution = self.unchanged(repository, reason).await;
        resolution.notices.push(notice);
        resolution
    }

    /// Enqueue `event` now and return a future for its resolution.
    fn submit(
        &self,
        repository: &RepositoryKey,
        event: Event,
    ) -> impl Future<Output = Resolution> + Send + 'static {
        let (reply, response) = oneshot::channel();
        let job = Job::Event {
            event,
            span: Span::current(),
            reply,
        };
        let enqueued = self.enqueue(repository, job);
        let repository = repository.clone();

        async move {
            let unavailable = || Resolution::unchanged(QueueStatus::Idle, Reason::WorkerUnavailable);
            if !enqueued {
                return unavailable();
            }
            response.await.unwrap_or_else(|_| {
                warn!("Worker for {} stopped before answering", repository);
                unavailable()
            })
        }
    }

    /// Hand `job` to the repository's worker, spawning or replacing it as
    /// needed. A new worker starts out idle, so it reconciles against the
    /// integration branch before doing anything else.
    fn enqueue(&self, repository: &RepositoryKey, job: Job) -> bool {
        let mut workers = self.lock_workers();

        let job = match workers.get(repository) {
            Some(sender) => match sender.send(job) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(job)) => {
                    warn!(
                        "Worker for {} has stopped; restarting it with reconciliation",
                        repository
                    );
                    job
                }
            },
            None => job,
        };
        let reconciles_first = !matches!(
            job,
            Job::Event {
                event: Event::ReconcileRequested,
                ..
            }
        );

        let sender = Worker::new(
            repository.clone(),
            self.config.clone(),
            self.gateway.clone(),
            self.notices.clone(),
        )
        .spawn();

        if reconciles_first {
            let (reply, _) = oneshot::channel();
            let _ = sender.send(Job::Event {
                event: Event::ReconcileRequested,
                span: Span::current(),
                reply,
            });
        }

        let enqueued = sender.send(job).is_ok();
        workers.insert(repository.clone(), sender);
        enqueued
    }

    fn lock_workers(&self) -> MutexGuard<'_, HashMap<RepositoryKey, mpsc::UnboundedSender<Job>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

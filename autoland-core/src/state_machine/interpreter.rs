//! Effect interpreter that executes effects against the hosting gateway.
//!
//! The interpreter is the boundary between the pure state machine and the
//! impure world of I/O. It takes effects (descriptions of what to do),
//! executes them, and turns every gateway outcome into a result event.
//! Notices are collected rather than sent; the worker dispatches them once
//! the inbound event has been fully processed.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::effect::{Effect, LogLevel, Notice};
use super::event::{Event, Operation};
use super::state::RepositoryKey;
use crate::gateway::{GatewayError, GatewayResult, HostingGateway};

/// Context needed by the interpreter to execute effects.
#[derive(Clone)]
pub struct InterpreterContext {
    pub gateway: Arc<dyn HostingGateway>,
    pub repository: RepositoryKey,
    pub integration_branch: String,
    /// Deadline for every gateway call.
    pub timeout: Duration,
}

impl InterpreterContext {
    /// Run a gateway call under the configured deadline.
    async fn bounded<T, F>(&self, call: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.timeout)),
        }
    }
}

/// What executing a batch of effects produced.
#[derive(Debug, Default)]
pub struct Executed {
    /// Result events, in effect order.
    pub events: Vec<Event>,
    /// Notices to deliver after the event is processed.
    pub notices: Vec<Notice>,
}

/// Execute a list of effects and collect result events.
///
/// Effects are executed sequentially. A failing effect never stops the
/// ones after it; its failure comes back as an event.
pub async fn execute_effects(ctx: &InterpreterContext, effects: Vec<Effect>) -> Executed {
    let mut executed = Executed::default();

    for effect in effects {
        match effect {
            Effect::Notify(notice) => executed.notices.push(notice),
            effect => {
                if let Some(event) = execute_effect(ctx, effect).await {
                    executed.events.push(event);
                }
            }
        }
    }

    executed
}

/// Execute a single effect.
async fn execute_effect(ctx: &InterpreterContext, effect: Effect) -> Option<Event> {
    let repo = &ctx.repository;
    match effect {
        Effect::ProbeIntegrationBranch => Some(answer(
            Operation::ProbeIntegrationBranch,
            ctx.bounded(ctx.gateway.get_branch(repo, &ctx.integration_branch))
                .await
                .map(|head| Event::IntegrationBranchProbed { head }),
        )),

        Effect::FetchPullRequest { pr_number } => Some(answer(
            Operation::FetchPullRequest,
            ctx.bounded(ctx.gateway.get_pull_request(repo, pr_number))
                .await
                .map(Event::PullRequestFetched),
        )),

        Effect::ResolveBaseHead { branch } => Some(answer(
            Operation::ResolveBaseHead,
            ctx.bounded(ctx.gateway.get_branch(repo, &branch))
                .await
                .map(|head| Event::BaseHeadResolved {
                    sha: head.map(|head| head.sha),
                }),
        )),

        Effect::CreateIntegrationBranch { from } => {
            info!(
                "Creating {} at {} in {}",
                ctx.integration_branch,
                from.short(),
                repo
            );
            Some(answer(
                Operation::CreateIntegrationBranch,
                ctx.bounded(
                    ctx.gateway
                        .create_branch(repo, &ctx.integration_branch, &from),
                )
                .await
                .map(|()| Event::IntegrationBranchCreated),
            ))
        }

        Effect::MergeIntoIntegration { head_sha, message } => Some(answer(
            Operation::MergeIntoIntegration,
            ctx.bounded(ctx.gateway.merge(
                repo,
                &ctx.integration_branch,
                &head_sha,
                &message,
            ))
            .await
            .map(|sha| Event::HeadMergedIntoIntegration { sha }),
        )),

        Effect::MergeIntoBase {
            base_branch,
            head_sha,
            message,
        } => {
            info!("Landing {} on {} in {}", head_sha.short(), base_branch, repo);
            Some(answer(
                Operation::MergeIntoBase,
                ctx.bounded(ctx.gateway.merge(repo, &base_branch, &head_sha, &message))
                    .await
                    .map(|sha| Event::Landed { sha }),
            ))
        }

        Effect::DeleteIntegrationBranch => Some(answer(
            Operation::DeleteIntegrationBranch,
            ctx.bounded(ctx.gateway.delete_branch(repo, &ctx.integration_branch))
                .await
                .map(|()| Event::IntegrationBranchDeleted),
        )),

        Effect::DeleteSourceBranch { repository, branch } => {
            match ctx
                .bounded(ctx.gateway.delete_branch(&repository, &branch))
                .await
            {
                Ok(()) | Err(GatewayError::NotFound) => None,
                Err(error) => Some(Event::SideEffectFailed {
                    operation: Operation::DeleteSourceBranch,
                    pr_number: None,
                    error,
                }),
            }
        }

        Effect::UpdateLabels {
            issue_number,
            remove,
            add,
        } => update_labels(ctx, issue_number, &remove, &add)
            .await
            .err()
            .map(|error| Event::SideEffectFailed {
                operation: Operation::UpdateLabels,
                pr_number: Some(issue_number),
                error,
            }),

        Effect::AssignIssue {
            issue_number,
            assignees,
        } => ctx
            .bounded(ctx.gateway.assign(repo, issue_number, &assignees))
            .await
            .err()
            .map(|error| Event::SideEffectFailed {
                operation: Operation::Assign,
                pr_number: Some(issue_number),
                error,
            }),

        // Collected by `execute_effects`.
        Effect::Notify(_) => None,

        Effect::Log { level, message } => {
            match level {
                LogLevel::Debug => debug!("{}", message),
                LogLevel::Info => info!("{}", message),
                LogLevel::Warn => warn!("{}", message),
                LogLevel::Error => error!("{}", message),
            }
            None
        }
    }
}

/// Turn a gateway result into the event the state machine waits for.
fn answer(operation: Operation, result: GatewayResult<Event>) -> Event {
    result.unwrap_or_else(|error| {
        warn!("Gateway call failed while {}: {}", operation, error);
        Event::GatewayFailed { operation, error }
    })
}

/// Read-modify-write of an issue's labels.
async fn update_labels(
    ctx: &InterpreterContext,
    issue_number: u64,
    remove: &[String],
    add: &[String],
) -> GatewayResult<()> {
    let issue = ctx
        .bounded(ctx.gateway.get_issue(&ctx.repository, issue_number))
        .await?;
    let mut labels: BTreeSet<String> = issue
        .labels
        .into_iter()
        .filter(|label| !remove.contains(label))
        .collect();
    labels.extend(add.iter().cloned());
    ctx.bounded(ctx.gateway.set_labels(&ctx.repository, issue_number, &labels))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::state::CommitSha;
    use crate::testing::{pull_request, Call, FakeHost, FakeOp};

    fn repo() -> RepositoryKey {
        RepositoryKey::new("octo", "widgets")
    }

    fn context(host: &Arc<FakeHost>) -> InterpreterContext {
        InterpreterContext {
            gateway: host.clone(),
            repository: repo(),
            integration_branch: "auto".to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn test_probe_reports_absent_branch() {
        let host = Arc::new(FakeHost::new());
        let executed = execute_effects(&context(&host), vec![Effect::ProbeIntegrationBranch]).await;

        assert_eq!(
            executed.events,
            vec![Event::IntegrationBranchProbed { head: None }]
        );
    }

    #[tokio::test]
    async fn test_create_conflict_becomes_gateway_failure() {
        let host = Arc::new(FakeHost::new());
        host.add_branch(&repo(), "auto", "tip0000", "someone else");

        let executed = execute_effects(
            &context(&host),
            vec![Effect::CreateIntegrationBranch {
                from: CommitSha::from("base000"),
            }],
        )
        .await;

        assert_eq!(
            executed.events,
            vec![Event::GatewayFailed {
                operation: Operation::CreateIntegrationBranch,
                error: GatewayError::AlreadyExists,
            }]
        );
    }

    #[tokio::test]
    async fn test_notices_are_collected_not_sent() {
        let host = Arc::new(FakeHost::new());
        let notice = Notice::IntegrationBranchLost { pr_number: 3 };

        let executed = execute_effects(
            &context(&host),
            vec![
                Effect::Notify(notice.clone()),
                Effect::log(LogLevel::Info, "hello"),
            ],
        )
        .await;

        assert!(executed.events.is_empty());
        assert_eq!(executed.notices, vec![notice]);
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_label_update_replaces_status_labels() {
        let host = Arc::new(FakeHost::new());
        host.put_labels(&repo(), 7, &["S-awaiting-review", "bug"]);

        let executed = execute_effects(
            &context(&host),
            vec![Effect::UpdateLabels {
                issue_number: 7,
                remove: vec!["S-awaiting-review".to_string()],
                add: vec!["S-awaiting-merge".to_string()],
            }],
        )
        .await;

        assert!(executed.events.is_empty());
        assert_eq!(
            host.labels(&repo(), 7),
            BTreeSet::from(["S-awaiting-merge".to_string(), "bug".to_string()])
        );
    }

    #[tokio::test]
    async fn test_best_effort_failure_is_reported() {
        let host = Arc::new(FakeHost::new());
        host.fail_next(FakeOp::Assign, GatewayError::transient("502"));

        let executed = execute_effects(
            &context(&host),
            vec![Effect::AssignIssue {
                issue_number: 7,
                assignees: vec!["bob".to_string()],
            }],
        )
        .await;

        assert_eq!(
            executed.events,
            vec![Event::SideEffectFailed {
                operation: Operation::Assign,
                pr_number: Some(7),
                error: GatewayError::transient("502"),
            }]
        );
    }

    #[tokio::test]
    async fn test_missing_source_branch_is_not_a_failure() {
        let host = Arc::new(FakeHost::new());

        let executed = execute_effects(
            &context(&host),
            vec![Effect::DeleteSourceBranch {
                repository: RepositoryKey::new("fork", "widgets"),
                branch: "feature".to_string(),
            }],
        )
        .await;

        assert!(executed.events.is_empty());
        assert_eq!(
            host.calls(),
            vec![Call::DeleteBranch {
                repo: RepositoryKey::new("fork", "widgets"),
                name: "feature".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_fetch_pull_request() {
        let host = Arc::new(FakeHost::new());
        host.add_pull_request(&repo(), pull_request(&repo(), 42, "head000"));

        let executed = execute_effects(
            &context(&host),
            vec![Effect::FetchPullRequest { pr_number: 42 }],
        )
        .await;

        assert_eq!(
            executed.events,
            vec![Event::PullRequestFetched(pull_request(
                &repo(),
                42,
                "head000"
            ))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_call_times_out() {
        let host = Arc::new(FakeHost::new());
        host.hang(FakeOp::DeleteBranch);

        let executed =
            execute_effects(&context(&host), vec![Effect::DeleteIntegrationBranch]).await;

        assert_eq!(
            executed.events,
            vec![Event::GatewayFailed {
                operation: Operation::DeleteIntegrationBranch,
                error: GatewayError::Timeout(Duration::from_secs(10)),
            }]
        );
    }
}

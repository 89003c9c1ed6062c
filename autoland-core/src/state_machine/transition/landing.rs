//! Landing an approved attempt into its base branch.
//!
//! CI has passed on an `r+` attempt. The pull request is re-fetched so that
//! a close or a push made while CI was running is noticed before anything is
//! merged; only the head SHA recorded at admission is ever landed.

use super::testing::release;
use super::{ignore_unexpected, operation_failed, TransitionResult};
use crate::config::QueueConfig;
use crate::gateway::GatewayError;
use crate::merge_message;
use crate::state_machine::effect::{Effect, LogLevel};
use crate::state_machine::event::Event;
use crate::state_machine::state::{QueueState, Verdict};

pub fn handle(state: QueueState, event: Event, config: &QueueConfig) -> TransitionResult {
    let (attempt, pull_request) = match state {
        QueueState::Landing {
            attempt,
            pull_request,
        } => (attempt, pull_request),
        other => return ignore_unexpected(other, &event),
    };

    match (pull_request, event) {
        (None, Event::PullRequestFetched(pr)) if !pr.open => {
            release(attempt, Verdict::PullRequestClosed)
        }

        (None, Event::PullRequestFetched(pr)) if pr.head_sha != attempt.head_sha => {
            let current = pr.head_sha;
            let mut result = release(attempt, Verdict::HeadChanged { current });
            result.effects.insert(
                0,
                Effect::log(
                    LogLevel::Warn,
                    "Pull request head moved after approval; not landing",
                ),
            );
            result
        }

        (None, Event::PullRequestFetched(pr)) => {
            let effect = Effect::MergeIntoBase {
                base_branch: attempt.base_branch.clone(),
                head_sha: attempt.head_sha.clone(),
                message: merge_message::landing_message(&attempt),
            };
            TransitionResult::new(
                QueueState::Landing {
                    attempt,
                    pull_request: Some(pr),
                },
                vec![effect],
            )
        }

        (Some(pr), Event::Landed { sha }) => {
            let mut attempt = attempt;
            attempt.landed_sha = Some(sha.clone());

            let mut effects = Vec::new();
            if config.delete_source_branch {
                match pr.head_repository() {
                    Some(repository) => effects.push(Effect::DeleteSourceBranch {
                        repository,
                        branch: pr.head_branch.clone(),
                    }),
                    None => effects.push(Effect::log(
                        LogLevel::Info,
                        format!(
                            "Head repository of #{} is gone; not deleting its branch",
                            pr.number
                        ),
                    )),
                }
            }
            effects.push(Effect::DeleteIntegrationBranch);

            TransitionResult::new(
                QueueState::Releasing {
                    attempt,
                    verdict: Verdict::Landed { sha },
                },
                effects,
            )
        }

        (
            Some(_),
            Event::GatewayFailed {
                error: GatewayError::Conflict(_),
                ..
            },
        ) => release(attempt, Verdict::MergeConflict),

        // Nothing was merged (or the outcome is unknown): keep holding the
        // branch so a redelivered callback or reconciliation can retry.
        (_, Event::GatewayFailed { operation, error }) => {
            let pr_number = Some(attempt.pr_number);
            operation_failed(QueueState::Testing { attempt }, pr_number, operation, &error)
        }

        (pull_request, event) => ignore_unexpected(
            QueueState::Landing {
                attempt,
                pull_request,
            },
            &event,
        ),
    }
}

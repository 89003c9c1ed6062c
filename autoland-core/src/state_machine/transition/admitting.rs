//! Admission of a new integration attempt.
//!
//! Stages run strictly in order and each waits for one gateway answer:
//! probe the integration branch, fetch the pull request, resolve the base
//! head, create the branch, merge the head into it. Nothing remote is
//! mutated before the probe says the branch is free, and `AlreadyExists`
//! from the create call is taken as a final rejection.
//!
//! A create that timed out or failed transiently may still have happened,
//! so it rolls back by deleting the branch; a definite refusal aborts
//! directly. Once the branch exists, any merge failure rolls back.

use super::{ignore_unexpected, operation_failed, TransitionResult};
use crate::config::QueueConfig;
use crate::gateway::GatewayError;
use crate::merge_message::{self, MergeMarker};
use crate::state_machine::effect::{Effect, LogLevel, Notice};
use crate::state_machine::event::Event;
use crate::state_machine::outcome::Reason;
use crate::state_machine::state::{
    AdmissionFailure, AdmissionStage, IntegrationAttempt, QueueState, StartRequest,
};

pub fn handle(state: QueueState, event: Event, config: &QueueConfig) -> TransitionResult {
    let (request, stage) = match state {
        QueueState::Admitting { request, stage } => (request, stage),
        other => return ignore_unexpected(other, &event),
    };

    match (stage, event) {
        // =====================================================================
        // Probing
        // =====================================================================
        (AdmissionStage::Probing, Event::IntegrationBranchProbed { head: Some(head) }) => {
            let active_pr = merge_message::pr_number_of(&head.message);
            conflict(&request, active_pr)
        }

        (AdmissionStage::Probing, Event::IntegrationBranchProbed { head: None }) => {
            let pr_number = request.pr_number;
            TransitionResult::new(
                QueueState::Admitting {
                    request,
                    stage: AdmissionStage::FetchingPullRequest,
                },
                vec![Effect::FetchPullRequest { pr_number }],
            )
        }

        // =====================================================================
        // Fetching the pull request
        // =====================================================================
        (AdmissionStage::FetchingPullRequest, Event::PullRequestFetched(pr)) if !pr.open => {
            abort(&request, AdmissionFailure::PullRequestClosed)
        }

        (AdmissionStage::FetchingPullRequest, Event::PullRequestFetched(pr)) => {
            let branch = pr.base_branch.clone();
            TransitionResult::new(
                QueueState::Admitting {
                    request,
                    stage: AdmissionStage::ResolvingBase { pr },
                },
                vec![Effect::ResolveBaseHead { branch }],
            )
        }

        // =====================================================================
        // Resolving the base head
        // =====================================================================
        (AdmissionStage::ResolvingBase { pr }, Event::BaseHeadResolved { sha: None }) => abort(
            &request,
            AdmissionFailure::BaseBranchMissing {
                branch: pr.base_branch,
            },
        ),

        (AdmissionStage::ResolvingBase { pr }, Event::BaseHeadResolved { sha: Some(sha) }) => {
            TransitionResult::new(
                QueueState::Admitting {
                    request,
                    stage: AdmissionStage::CreatingBranch {
                        pr,
                        base_sha: sha.clone(),
                    },
                },
                vec![Effect::CreateIntegrationBranch { from: sha }],
            )
        }

        // =====================================================================
        // Creating the integration branch
        // =====================================================================
        (AdmissionStage::CreatingBranch { pr, base_sha }, Event::IntegrationBranchCreated) => {
            let marker = MergeMarker {
                pr_number: request.pr_number,
                mode: request.mode,
                requested_by: request.requested_by.clone(),
                base_branch: pr.base_branch.clone(),
                base_sha: base_sha.clone(),
                head_sha: pr.head_sha.clone(),
            };
            let head_sha = pr.head_sha.clone();
            TransitionResult::new(
                QueueState::Admitting {
                    request,
                    stage: AdmissionStage::MergingHead { pr, base_sha },
                },
                vec![Effect::MergeIntoIntegration {
                    head_sha,
                    message: marker.render(),
                }],
            )
        }

        (
            AdmissionStage::CreatingBranch { .. },
            Event::GatewayFailed {
                error: GatewayError::AlreadyExists,
                ..
            },
        ) => conflict(&request, None),

        (AdmissionStage::CreatingBranch { .. }, Event::GatewayFailed { operation, error })
            if error.is_indeterminate() =>
        {
            roll_back(request, AdmissionFailure::gateway(operation, &error))
        }

        (AdmissionStage::CreatingBranch { .. }, Event::GatewayFailed { operation, error }) => {
            abort(&request, AdmissionFailure::gateway(operation, &error))
        }

        // =====================================================================
        // Merging the head into the integration branch
        // =====================================================================
        (
            AdmissionStage::MergingHead { pr, base_sha },
            Event::HeadMergedIntoIntegration { sha },
        ) => {
            let attempt = IntegrationAttempt {
                pr_number: request.pr_number,
                mode: request.mode,
                base_branch: pr.base_branch,
                base_sha,
                head_sha: pr.head_sha,
                integration_sha: Some(sha),
                requested_by: request.requested_by,
                landed_sha: None,
            };
            let effects = vec![
                Effect::UpdateLabels {
                    issue_number: attempt.pr_number,
                    remove: vec![config.awaiting_review_label.clone()],
                    add: vec![config.awaiting_merge_label.clone()],
                },
                Effect::Notify(Notice::AttemptStarted {
                    pr_number: attempt.pr_number,
                    mode: attempt.mode,
                    requested_by: attempt.requested_by.clone(),
                    head_sha: attempt.head_sha.clone(),
                }),
            ];
            let reason = Reason::Started {
                pr_number: attempt.pr_number,
                mode: attempt.mode,
            };
            TransitionResult::new(QueueState::Testing { attempt }, effects).with_reason(reason)
        }

        (
            AdmissionStage::MergingHead { .. },
            Event::GatewayFailed {
                error: GatewayError::Conflict(_),
                ..
            },
        ) => roll_back(request, AdmissionFailure::MergeConflict),

        (AdmissionStage::MergingHead { .. }, Event::GatewayFailed { operation, error }) => {
            roll_back(request, AdmissionFailure::gateway(operation, &error))
        }

        // =====================================================================
        // Rolling back
        // =====================================================================
        (AdmissionStage::RollingBack { failure }, Event::IntegrationBranchDeleted)
        | (
            AdmissionStage::RollingBack { failure },
            Event::GatewayFailed {
                error: GatewayError::NotFound,
                ..
            },
        ) => abort(&request, failure),

        (AdmissionStage::RollingBack { failure }, Event::GatewayFailed { error, .. }) => {
            let mut result = abort(&request, failure);
            result.effects.push(Effect::Notify(Notice::IntegrationBranchLeaked {
                pr_number: request.pr_number,
                error: error.to_string(),
            }));
            result
        }

        // =====================================================================
        // Failures before anything was created
        // =====================================================================
        (
            AdmissionStage::Probing
            | AdmissionStage::FetchingPullRequest
            | AdmissionStage::ResolvingBase { .. },
            Event::GatewayFailed { operation, error },
        ) => operation_failed(QueueState::Idle, Some(request.pr_number), operation, &error),

        (stage, event) => ignore_unexpected(QueueState::Admitting { request, stage }, &event),
    }
}

fn conflict(request: &StartRequest, active_pr: Option<u64>) -> TransitionResult {
    TransitionResult::new(
        QueueState::Idle,
        vec![
            Effect::log(
                LogLevel::Info,
                format!(
                    "Rejecting #{}: integration branch is taken{}",
                    request.pr_number,
                    active_pr.map_or(String::new(), |pr| format!(" by #{}", pr))
                ),
            ),
            Effect::Notify(Notice::BranchConflict {
                pr_number: request.pr_number,
                active_pr,
            }),
        ],
    )
    .with_reason(Reason::BranchConflict { active_pr })
}

fn abort(request: &StartRequest, failure: AdmissionFailure) -> TransitionResult {
    TransitionResult::new(
        QueueState::Idle,
        vec![Effect::Notify(Notice::AdmissionAborted {
            pr_number: request.pr_number,
            failure: failure.clone(),
        })],
    )
    .with_reason(Reason::Aborted(failure))
}

fn roll_back(request: StartRequest, failure: AdmissionFailure) -> TransitionResult {
    TransitionResult::new(
        QueueState::Admitting {
            request,
            stage: AdmissionStage::RollingBack { failure },
        },
        vec![Effect::DeleteIntegrationBranch],
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::test_support::*;
    use super::super::transition;
    use super::*;
    use crate::gateway::{BranchHead, PullRequestInfo};
    use crate::state_machine::event::Operation;
    use crate::state_machine::state::fixtures::{pull_request, request};
    use crate::state_machine::state::{AttemptMode, CommitSha};

    fn admitting(stage: AdmissionStage) -> QueueState {
        QueueState::Admitting {
            request: request(42, AttemptMode::Merge),
            stage,
        }
    }

    fn creating() -> QueueState {
        admitting(AdmissionStage::CreatingBranch {
            pr: pull_request(42),
            base_sha: CommitSha::from("base000"),
        })
    }

    fn merging() -> QueueState {
        admitting(AdmissionStage::MergingHead {
            pr: pull_request(42),
            base_sha: CommitSha::from("base000"),
        })
    }

    #[test]
    fn test_existing_branch_is_a_conflict() {
        let result = transition(
            admitting(AdmissionStage::Probing),
            Event::IntegrationBranchProbed {
                head: Some(BranchHead {
                    sha: CommitSha::from("tip"),
                    message: "Auto merge of #41 (try) by bob\n\nbase-branch: main\nbase: a\nhead: b"
                        .to_string(),
                }),
            },
            &config(),
        );

        assert_eq!(result.state, QueueState::Idle);
        assert_eq!(
            result.reason,
            Some(Reason::BranchConflict {
                active_pr: Some(41)
            })
        );
        assert!(gateway_effects(&result).is_empty());
        assert_eq!(
            notices(&result),
            vec![&Notice::BranchConflict {
                pr_number: 42,
                active_pr: Some(41)
            }]
        );
    }

    #[test]
    fn test_free_branch_fetches_pull_request() {
        let result = transition(
            admitting(AdmissionStage::Probing),
            Event::IntegrationBranchProbed { head: None },
            &config(),
        );

        assert_eq!(result.state, admitting(AdmissionStage::FetchingPullRequest));
        assert_eq!(result.effects, vec![Effect::FetchPullRequest { pr_number: 42 }]);
    }

    #[test]
    fn test_closed_pull_request_aborts_without_touching_branches() {
        let result = transition(
            admitting(AdmissionStage::FetchingPullRequest),
            Event::PullRequestFetched(PullRequestInfo {
                open: false,
                ..pull_request(42)
            }),
            &config(),
        );

        assert_eq!(result.state, QueueState::Idle);
        assert_eq!(
            result.reason,
            Some(Reason::Aborted(AdmissionFailure::PullRequestClosed))
        );
        assert!(gateway_effects(&result).is_empty());
    }

    #[test]
    fn test_open_pull_request_resolves_its_base() {
        let result = transition(
            admitting(AdmissionStage::FetchingPullRequest),
            Event::PullRequestFetched(pull_request(42)),
            &config(),
        );

        assert_eq!(
            result.effects,
            vec![Effect::ResolveBaseHead {
                branch: "main".to_string()
            }]
        );
    }

    #[test]
    fn test_missing_base_branch_aborts() {
        let result = transition(
            admitting(AdmissionStage::ResolvingBase {
                pr: pull_request(42),
            }),
            Event::BaseHeadResolved { sha: None },
            &config(),
        );

        assert_eq!(result.state, QueueState::Idle);
        assert_eq!(
            result.reason,
            Some(Reason::Aborted(AdmissionFailure::BaseBranchMissing {
                branch: "main".to_string()
            }))
        );
    }

    #[test]
    fn test_base_head_creates_branch_from_it() {
        let result = transition(
            admitting(AdmissionStage::ResolvingBase {
                pr: pull_request(42),
            }),
            Event::BaseHeadResolved {
                sha: Some(CommitSha::from("base000")),
            },
            &config(),
        );

        assert_eq!(result.state, creating());
        assert_eq!(
            result.effects,
            vec![Effect::CreateIntegrationBranch {
                from: CommitSha::from("base000")
            }]
        );
    }

    #[test]
    fn test_created_branch_merges_head_with_marker() {
        let result = transition(creating(), Event::IntegrationBranchCreated, &config());

        assert_eq!(result.state, merging());
        let [Effect::MergeIntoIntegration { head_sha, message }] = result.effects.as_slice() else {
            panic!("expected a single merge, got {:?}", result.effects);
        };
        assert_eq!(head_sha, &CommitSha::from("head000"));
        let marker = MergeMarker::parse(message).unwrap();
        assert_eq!(marker.pr_number, 42);
        assert_eq!(marker.mode, AttemptMode::Merge);
        assert_eq!(marker.base_sha, CommitSha::from("base000"));
    }

    #[test]
    fn test_already_exists_on_create_is_final_conflict() {
        let result = transition(
            creating(),
            Event::GatewayFailed {
                operation: Operation::CreateIntegrationBranch,
                error: GatewayError::AlreadyExists,
            },
            &config(),
        );

        assert_eq!(result.state, QueueState::Idle);
        assert_eq!(
            result.reason,
            Some(Reason::BranchConflict { active_pr: None })
        );
        // The branch belongs to someone else: do not delete it.
        assert!(gateway_effects(&result).is_empty());
    }

    #[test]
    fn test_create_timeout_rolls_back() {
        let result = transition(
            creating(),
            Event::GatewayFailed {
                operation: Operation::CreateIntegrationBranch,
                error: GatewayError::Timeout(Duration::from_secs(10)),
            },
            &config(),
        );

        assert!(matches!(
            result.state,
            QueueState::Admitting {
                stage: AdmissionStage::RollingBack { .. },
                ..
            }
        ));
        assert_eq!(result.effects, vec![Effect::DeleteIntegrationBranch]);
        assert_eq!(result.reason, None);
    }

    #[test]
    fn test_refused_create_aborts_without_deleting() {
        let result = transition(
            creating(),
            Event::GatewayFailed {
                operation: Operation::CreateIntegrationBranch,
                error: GatewayError::NotFound,
            },
            &config(),
        );

        assert_eq!(result.state, QueueState::Idle);
        assert_eq!(
            result.reason,
            Some(Reason::Aborted(AdmissionFailure::gateway(
                Operation::CreateIntegrationBranch,
                &GatewayError::NotFound
            )))
        );
        assert!(gateway_effects(&result).is_empty());
    }

    #[test]
    fn test_merge_success_commits_testing_and_relabels() {
        let result = transition(
            merging(),
            Event::HeadMergedIntoIntegration {
                sha: CommitSha::from("merge111"),
            },
            &config(),
        );

        let QueueState::Testing { attempt } = &result.state else {
            panic!("expected Testing, got {:?}", result.state);
        };
        assert_eq!(attempt.pr_number, 42);
        assert_eq!(attempt.mode, AttemptMode::Merge);
        assert_eq!(attempt.base_sha, CommitSha::from("base000"));
        assert_eq!(attempt.head_sha, CommitSha::from("head000"));
        assert_eq!(attempt.integration_sha, Some(CommitSha::from("merge111")));

        assert_eq!(
            gateway_effects(&result),
            vec![&Effect::UpdateLabels {
                issue_number: 42,
                remove: vec!["S-awaiting-review".to_string()],
                add: vec!["S-awaiting-merge".to_string()],
            }]
        );
        assert_eq!(
            result.reason,
            Some(Reason::Started {
                pr_number: 42,
                mode: AttemptMode::Merge
            })
        );
    }

    #[test]
    fn test_merge_conflict_rolls_back_then_aborts() {
        let config = config();
        let rolling = transition(
            merging(),
            Event::GatewayFailed {
                operation: Operation::MergeIntoIntegration,
                error: GatewayError::Conflict("Merge conflict".to_string()),
            },
            &config,
        );
        assert_eq!(rolling.effects, vec![Effect::DeleteIntegrationBranch]);

        let done = transition(rolling.state, Event::IntegrationBranchDeleted, &config);
        assert_eq!(done.state, QueueState::Idle);
        assert_eq!(
            done.reason,
            Some(Reason::Aborted(AdmissionFailure::MergeConflict))
        );
    }

    #[test]
    fn test_roll_back_tolerates_missing_branch() {
        let result = transition(
            admitting(AdmissionStage::RollingBack {
                failure: AdmissionFailure::MergeConflict,
            }),
            Event::GatewayFailed {
                operation: Operation::DeleteIntegrationBranch,
                error: GatewayError::NotFound,
            },
            &config(),
        );

        assert_eq!(result.state, QueueState::Idle);
        assert_eq!(notices(&result).len(), 1);
    }

    #[test]
    fn test_failed_roll_back_reports_leak() {
        let result = transition(
            admitting(AdmissionStage::RollingBack {
                failure: AdmissionFailure::MergeConflict,
            }),
            Event::GatewayFailed {
                operation: Operation::DeleteIntegrationBranch,
                error: GatewayError::transient("500"),
            },
            &config(),
        );

        assert_eq!(result.state, QueueState::Idle);
        assert!(notices(&result)
            .iter()
            .any(|notice| matches!(notice, Notice::IntegrationBranchLeaked { pr_number: 42, .. })));
    }

    #[test]
    fn test_probe_failure_returns_to_idle() {
        let result = transition(
            admitting(AdmissionStage::Probing),
            Event::GatewayFailed {
                operation: Operation::ProbeIntegrationBranch,
                error: GatewayError::Timeout(Duration::from_secs(10)),
            },
            &config(),
        );

        assert_eq!(result.state, QueueState::Idle);
        assert!(gateway_effects(&result).is_empty());
        assert!(matches!(
            result.reason,
            Some(Reason::OperationFailed {
                operation: Operation::ProbeIntegrationBranch,
                ..
            })
        ));
    }
}

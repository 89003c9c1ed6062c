//! Testing state transitions.

use super::{ignore_unexpected, TransitionResult};
use crate::config::QueueConfig;
use crate::merge_message;
use crate::state_machine::effect::{Effect, LogLevel, Notice};
use crate::state_machine::event::{CiReport, CiStatus, Event};
use crate::state_machine::outcome::{IgnoreReason, Reason};
use crate::state_machine::state::{AttemptMode, IntegrationAttempt, QueueState, Verdict};

/// Handle transitions from the Testing state.
///
/// The attempt holds the integration branch until a conclusive CI report
/// for it arrives. Inconclusive reports leave it in place.
pub fn handle(state: QueueState, event: Event, config: &QueueConfig) -> TransitionResult {
    let attempt = match state {
        QueueState::Testing { attempt } => attempt,
        other => return ignore_unexpected(other, &event),
    };

    match event {
        Event::StartRequested(request) => {
            let active_pr = Some(attempt.pr_number);
            TransitionResult::new(
                QueueState::Testing { attempt },
                vec![Effect::Notify(Notice::BranchConflict {
                    pr_number: request.pr_number,
                    active_pr,
                })],
            )
            .with_reason(Reason::BranchConflict { active_pr })
        }

        Event::CiReported(report) if report.branch != config.integration_branch => {
            TransitionResult::no_change(QueueState::Testing { attempt }).with_reason(
                Reason::Ignored(IgnoreReason::OtherBranch {
                    branch: report.branch,
                }),
            )
        }

        Event::CiReported(report) if is_stale(&attempt, &report) => TransitionResult::new(
            QueueState::Testing { attempt },
            vec![Effect::log(
                LogLevel::Info,
                format!(
                    "Ignoring stale CI report for commit {}",
                    report.commit.as_ref().map_or("-", |sha| sha.short())
                ),
            )],
        )
        .with_reason(Reason::Ignored(IgnoreReason::StaleCallback)),

        Event::CiReported(report) => on_ci_report(attempt, report),

        Event::ReconcileRequested => TransitionResult::new(
            QueueState::Reconciling {
                attempt: Some(attempt),
            },
            vec![Effect::ProbeIntegrationBranch],
        ),

        event => ignore_unexpected(QueueState::Testing { attempt }, &event),
    }
}

fn on_ci_report(attempt: IntegrationAttempt, report: CiReport) -> TransitionResult {
    // Already merged on an earlier delivery; only the branch is left.
    if let Some(sha) = attempt.landed_sha.clone() {
        return release(attempt, Verdict::Landed { sha });
    }

    match (report.status, attempt.mode) {
        (CiStatus::Passed, AttemptMode::DryRun) => release(attempt, Verdict::Passed),

        (CiStatus::Passed, AttemptMode::Merge) => {
            let pr_number = attempt.pr_number;
            TransitionResult::new(
                QueueState::Landing {
                    attempt,
                    pull_request: None,
                },
                vec![Effect::FetchPullRequest { pr_number }],
            )
        }

        (CiStatus::Failed, _) => release(attempt, Verdict::Failed),

        (CiStatus::Unrecognized(status), _) => {
            let notice = Notice::UnknownCiStatus {
                pr_number: attempt.pr_number,
                status: CiStatus::Unrecognized(status.clone()),
                build_url: report.build_url,
            };
            TransitionResult::new(
                QueueState::Testing { attempt },
                vec![
                    Effect::log(
                        LogLevel::Warn,
                        format!("Unrecognized CI state `{}`, keeping the attempt", status),
                    ),
                    Effect::Notify(notice),
                ],
            )
            .with_reason(Reason::Inconclusive { status })
        }
    }
}

/// Start deleting the integration branch for a finished attempt.
pub(crate) fn release(attempt: IntegrationAttempt, verdict: Verdict) -> TransitionResult {
    TransitionResult::new(
        QueueState::Releasing { attempt, verdict },
        vec![Effect::DeleteIntegrationBranch],
    )
}

/// A report is stale when it names a different commit or pull request
/// than the attempt holding the branch. Missing fields never make it stale.
fn is_stale(attempt: &IntegrationAttempt, report: &CiReport) -> bool {
    if let (Some(built), Some(tip)) = (&report.commit, &attempt.integration_sha) {
        if built != tip {
            return true;
        }
    }
    report
        .message
        .as_deref()
        .and_then(merge_message::pr_number_of)
        .is_some_and(|pr_number| pr_number != attempt.pr_number)
}

//! Reconciliation against the remote integration branch.
//!
//! The branch is the lock, so whenever local state and the remote branch
//! disagree the branch wins:
//!
//! | local   | remote                | result                     |
//! |---------|-----------------------|----------------------------|
//! | idle    | absent                | idle                       |
//! | idle    | present, marker       | testing (adopted)          |
//! | idle    | present, no marker    | idle, operator notified    |
//! | testing | absent                | idle, operator notified    |
//! | testing | present               | testing                    |

use super::{ignore_unexpected, operation_failed, TransitionResult};
use crate::merge_message::MergeMarker;
use crate::state_machine::effect::{Effect, LogLevel, Notice};
use crate::state_machine::event::Event;
use crate::state_machine::outcome::{Reason, ReconcileOutcome};
use crate::state_machine::state::{QueueState, Verdict};

pub fn handle(state: QueueState, event: Event) -> TransitionResult {
    let attempt = match state {
        QueueState::Reconciling { attempt } => attempt,
        other => return ignore_unexpected(other, &event),
    };

    match (attempt, event) {
        (None, Event::IntegrationBranchProbed { head: None }) => {
            TransitionResult::no_change(QueueState::Idle)
                .with_reason(Reason::Reconciled(ReconcileOutcome::InSync))
        }

        (None, Event::IntegrationBranchProbed { head: Some(head) }) => {
            match MergeMarker::parse(&head.message) {
                Some(marker) => {
                    let adopted = marker.into_attempt(head.sha);
                    let pr_number = adopted.pr_number;
                    let notice = Notice::AttemptRecovered {
                        pr_number,
                        mode: adopted.mode,
                    };
                    TransitionResult::new(
                        QueueState::Testing { attempt: adopted },
                        vec![Effect::Notify(notice)],
                    )
                    .with_reason(Reason::Reconciled(ReconcileOutcome::Adopted { pr_number }))
                }
                None => TransitionResult::new(
                    QueueState::Idle,
                    vec![Effect::Notify(Notice::UnknownIntegrationBranch { sha: head.sha })],
                )
                .with_reason(Reason::Reconciled(ReconcileOutcome::UnknownBranch)),
            }
        }

        (Some(attempt), Event::IntegrationBranchProbed { head: None }) => {
            let pr_number = attempt.pr_number;
            // A landed attempt whose branch is gone has nothing left to do.
            let notice = match attempt.landed_sha.clone() {
                Some(sha) => Notice::AttemptFinished {
                    pr_number,
                    mode: attempt.mode,
                    verdict: Verdict::Landed { sha },
                },
                None => Notice::IntegrationBranchLost { pr_number },
            };
            TransitionResult::new(QueueState::Idle, vec![Effect::Notify(notice)])
                .with_reason(Reason::Reconciled(ReconcileOutcome::Released { pr_number }))
        }

        (Some(mut attempt), Event::IntegrationBranchProbed { head: Some(head) }) => {
            let mut effects = Vec::new();
            if attempt.integration_sha.as_ref() != Some(&head.sha) {
                if attempt.integration_sha.is_some() {
                    effects.push(Effect::log(
                        LogLevel::Warn,
                        format!(
                            "Integration branch for #{} moved to {}",
                            attempt.pr_number,
                            head.sha.short()
                        ),
                    ));
                }
                attempt.integration_sha = Some(head.sha);
            }
            TransitionResult::new(QueueState::Testing { attempt }, effects)
                .with_reason(Reason::Reconciled(ReconcileOutcome::InSync))
        }

        (attempt, Event::GatewayFailed { operation, error }) => {
            let pr_number = attempt.as_ref().map(|attempt| attempt.pr_number);
            let restored = match attempt {
                Some(attempt) => QueueState::Testing { attempt },
                None => QueueState::Idle,
            };
            operation_failed(restored, pr_number, operation, &error)
        }

        (attempt, event) => ignore_unexpected(QueueState::Reconciling { attempt }, &event),
    }
}

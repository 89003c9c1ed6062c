//! Releasing state transitions.

use super::{ignore_unexpected, operation_failed, TransitionResult};
use crate::gateway::GatewayError;
use crate::state_machine::effect::{Effect, Notice};
use crate::state_machine::event::Event;
use crate::state_machine::outcome::Reason;
use crate::state_machine::state::QueueState;

/// Handle transitions from the Releasing state.
///
/// The lock is only given up once the integration branch is confirmed gone.
/// If the delete fails the attempt stays `Testing`; for a landed attempt
/// `landed_sha` is kept so the merge is not repeated.
pub fn handle(state: QueueState, event: Event) -> TransitionResult {
    let (attempt, verdict) = match state {
        QueueState::Releasing { attempt, verdict } => (attempt, verdict),
        other => return ignore_unexpected(other, &event),
    };

    match event {
        Event::IntegrationBranchDeleted
        | Event::GatewayFailed {
            error: GatewayError::NotFound,
            ..
        } => {
            let notice = Notice::AttemptFinished {
                pr_number: attempt.pr_number,
                mode: attempt.mode,
                verdict: verdict.clone(),
            };
            TransitionResult::new(QueueState::Idle, vec![Effect::Notify(notice)]).with_reason(
                Reason::Finished {
                    pr_number: attempt.pr_number,
                    verdict,
                },
            )
        }

        Event::GatewayFailed { operation, error } => {
            let pr_number = Some(attempt.pr_number);
            operation_failed(QueueState::Testing { attempt }, pr_number, operation, &error)
        }

        event => ignore_unexpected(QueueState::Releasing { attempt, verdict }, &event),
    }
}

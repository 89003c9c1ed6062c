//! Idle state transitions.

use super::{ignore_unexpected, TransitionResult};
use crate::config::QueueConfig;
use crate::state_machine::effect::{Effect, LogLevel};
use crate::state_machine::event::Event;
use crate::state_machine::outcome::{IgnoreReason, Reason};
use crate::state_machine::state::{AdmissionStage, QueueState};

/// Handle transitions from the Idle state.
///
/// A start request does not trust the local `Idle`: admission begins by
/// checking the remote integration branch.
pub fn handle(state: QueueState, event: Event, config: &QueueConfig) -> TransitionResult {
    match event {
        Event::StartRequested(request) => TransitionResult::new(
            QueueState::Admitting {
                request,
                stage: AdmissionStage::Probing,
            },
            vec![Effect::ProbeIntegrationBranch],
        ),

        Event::CiReported(report) if report.branch != config.integration_branch => {
            TransitionResult::no_change(state).with_reason(Reason::Ignored(
                IgnoreReason::OtherBranch {
                    branch: report.branch,
                },
            ))
        }

        Event::CiReported(report) => TransitionResult::new(
            state,
            vec![Effect::log(
                LogLevel::Info,
                format!(
                    "Ignoring CI report ({}) with no attempt in flight",
                    report.status
                ),
            )],
        )
        .with_reason(Reason::Ignored(IgnoreReason::NoActiveAttempt)),

        Event::ReconcileRequested => TransitionResult::new(
            QueueState::Reconciling { attempt: None },
            vec![Effect::ProbeIntegrationBranch],
        ),

        event => ignore_unexpected(state, &event),
    }
}

//! Pure state transition function.
//!
//! The transition function takes the current state, an event and the queue
//! configuration, and returns the new state, the effects to execute and,
//! when the event decides the outcome, a [`Reason`]. It has no side effects.
//!
//! Each state has its own handler module with co-located tests:
//! - `idle`: no attempt in flight
//! - `admitting`: probe, create and merge into the integration branch
//! - `testing`: waiting for CI
//! - `landing`: merging an approved attempt into its base branch
//! - `releasing`: deleting the integration branch
//! - `reconciling`: comparing local state with the remote branch

mod admitting;
mod idle;
mod landing;
mod reconciling;
mod releasing;
mod testing;

use super::effect::{Effect, LogLevel, Notice};
use super::event::{Event, Operation};
use super::outcome::{IgnoreReason, Reason};
use super::state::QueueState;
use crate::config::QueueConfig;
use crate::gateway::GatewayError;

/// Result of a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult {
    /// The new state after the transition.
    pub state: QueueState,
    /// Effects to execute.
    pub effects: Vec<Effect>,
    /// Set when this step decides how the inbound event resolves.
    pub reason: Option<Reason>,
}

impl TransitionResult {
    pub fn new(state: QueueState, effects: Vec<Effect>) -> Self {
        Self {
            state,
            effects,
            reason: None,
        }
    }

    pub fn no_change(state: QueueState) -> Self {
        Self::new(state, vec![])
    }

    pub fn with_reason(mut self, reason: Reason) -> Self {
        self.reason = Some(reason);
        self
    }
}

/// Pure state transition function.
///
/// Review assignment and best-effort failures are handled the same way in
/// every state; everything else is dispatched to the state's handler.
pub fn transition(state: QueueState, event: Event, config: &QueueConfig) -> TransitionResult {
    match event {
        Event::ReviewAssignmentRequested {
            pr_number,
            assignee,
        } => assign_review(state, pr_number, assignee, config),
        Event::SideEffectFailed {
            operation,
            pr_number,
            error,
        } => side_effect_failed(state, operation, pr_number, error),
        event => match &state {
            QueueState::Idle => idle::handle(state, event, config),
            QueueState::Admitting { .. } => admitting::handle(state, event, config),
            QueueState::Testing { .. } => testing::handle(state, event, config),
            QueueState::Landing { .. } => landing::handle(state, event, config),
            QueueState::Releasing { .. } => releasing::handle(state, event),
            QueueState::Reconciling { .. } => reconciling::handle(state, event),
        },
    }
}

/// `r?` never touches the queue: assign, relabel and report.
fn assign_review(
    state: QueueState,
    pr_number: u64,
    assignee: String,
    config: &QueueConfig,
) -> TransitionResult {
    TransitionResult::new(
        state,
        vec![
            Effect::AssignIssue {
                issue_number: pr_number,
                assignees: vec![assignee.clone()],
            },
            Effect::UpdateLabels {
                issue_number: pr_number,
                remove: vec![config.awaiting_merge_label.clone()],
                add: vec![config.awaiting_review_label.clone()],
            },
            Effect::Notify(Notice::ReviewAssigned {
                pr_number,
                assignee: assignee.clone(),
            }),
        ],
    )
    .with_reason(Reason::Assigned { assignee })
}

/// Best-effort failures are reported but never change the state or the
/// outcome of the event that caused them.
fn side_effect_failed(
    state: QueueState,
    operation: Operation,
    pr_number: Option<u64>,
    error: GatewayError,
) -> TransitionResult {
    let pr_number = pr_number.or_else(|| state.attempt().map(|attempt| attempt.pr_number));
    TransitionResult::new(
        state,
        vec![
            Effect::log(LogLevel::Warn, format!("{} failed: {}", operation, error)),
            Effect::Notify(Notice::OperationFailed {
                pr_number,
                operation,
                error: error.to_string(),
            }),
        ],
    )
}

/// Keep `state`, tell the operator that `operation` failed.
pub(crate) fn operation_failed(
    state: QueueState,
    pr_number: Option<u64>,
    operation: Operation,
    error: &GatewayError,
) -> TransitionResult {
    TransitionResult::new(
        state,
        vec![
            Effect::log(LogLevel::Error, format!("{} failed: {}", operation, error)),
            Effect::Notify(Notice::OperationFailed {
                pr_number,
                operation,
                error: error.to_string(),
            }),
        ],
    )
    .with_reason(Reason::OperationFailed {
        operation,
        error: error.to_string(),
    })
}

/// Catch-all for events that do not apply to `state`.
pub(crate) fn ignore_unexpected(state: QueueState, event: &Event) -> TransitionResult {
    let message = format!(
        "Ignoring unexpected {} in {} state",
        event.log_summary(),
        state.name()
    );
    TransitionResult::new(state, vec![Effect::log(LogLevel::Warn, message)])
        .with_reason(Reason::Ignored(IgnoreReason::UnexpectedEvent))
}

//! Per-repository worker task.
//!
//! Each repository is owned by one task that applies jobs strictly in the
//! order they were enqueued. Processing an inbound event runs the
//! transition/interpret loop until no result events remain, commits the
//! final state, and only then hands the collected notices to the
//! dispatcher.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, Instrument, Span};

use super::effect::Notice;
use super::event::Event;
use super::interpreter::{execute_effects, InterpreterContext};
use super::outcome::{IgnoreReason, Reason, Resolution};
use super::state::{QueueState, QueueStatus, RepositoryKey};
use super::transition::{transition, TransitionResult};
use crate::config::QueueConfig;
use crate::gateway::HostingGateway;
use crate::notifier::NoticeDispatcher;

/// Upper bound on transitions per inbound event. Admission plus rollback
/// is well under this; hitting it means the machine is looping.
const MAX_STEPS: usize = 64;

/// Work for a repository worker.
pub(crate) enum Job {
    Event {
        event: Event,
        /// Span of the request that produced the event.
        span: Span,
        reply: oneshot::Sender<Resolution>,
    },
    Status {
        reply: oneshot::Sender<QueueStatus>,
    },
}

pub(crate) struct Worker {
    state: QueueState,
    config: Arc<QueueConfig>,
    ctx: InterpreterContext,
    notices: NoticeDispatcher,
}

impl Worker {
    pub(crate) fn new(
        repository: RepositoryKey,
        config: Arc<QueueConfig>,
        gateway: Arc<dyn HostingGateway>,
        notices: NoticeDispatcher,
    ) -> Self {
        let ctx = InterpreterContext {
            gateway,
            repository,
            integration_branch: config.integration_branch.clone(),
            timeout: config.api_timeout,
        };
        Self {
            state: QueueState::Idle,
            config,
            ctx,
            notices,
        }
    }

    /// Spawn the worker and return its job queue.
    pub(crate) fn spawn(self) -> mpsc::UnboundedSender<Job> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let span = tracing::info_span!("repository", repo = %self.ctx.repository);
        tokio::spawn(self.run(receiver).instrument(span));
        sender
    }

    async fn run(mut self, mut jobs: mpsc::UnboundedReceiver<Job>) {
        debug!("Repository worker started");
        while let Some(job) = jobs.recv().await {
            match job {
                Job::Event { event, span, reply } => {
                    let resolution = self.process_event(event).instrument(span).await;
                    // The caller may have gone away; the state is committed anyway.
                    let _ = reply.send(resolution);
                }
                Job::Status { reply } => {
                    let _ = reply.send(self.state.status());
                }
            }
        }
        debug!("Repository worker stopped");
    }

    /// Process an inbound event: transition the state and execute effects.
    ///
    /// 1. Runs the transition function
    /// 2. Executes gateway effects via the interpreter
    /// 3. Feeds result events back in, depth first
    /// 4. Commits the final (settled) state
    /// 5. Dispatches notices
    pub(crate) async fn process_event(&mut self, event: Event) -> Resolution {
        let repository = self.ctx.repository.clone();
        let mut current_state = std::mem::take(&mut self.state);
        let mut reason = None;
        let mut notices: Vec<Notice> = Vec::new();

        let mut events_to_process = vec![event];
        let mut steps = 0;

        while let Some(event) = events_to_process.pop() {
            steps += 1;
            if steps > MAX_STEPS {
                error!(
                    "Gave up after {} transitions in {} state; dropping {}",
                    MAX_STEPS,
                    current_state.name(),
                    event.log_summary()
                );
                break;
            }

            info!(
                "Processing event {} for {} in state {}",
                event.log_summary(),
                repository,
                current_state.name()
            );

            let TransitionResult {
                state,
                effects,
                reason: step_reason,
            } = transition(current_state, event, &self.config);
            current_state = state;
            if step_reason.is_some() {
                reason = step_reason;
            }

            if !effects.is_empty() {
                debug!("Executing {} effects for {}", effects.len(), repository);
                let executed = execute_effects(&self.ctx, effects).await;
                notices.extend(executed.notices);

                // Pushed in reverse so they are processed in order.
                for result_event in executed.events.into_iter().rev() {
                    events_to_process.push(result_event);
                }
            }
        }

        if !current_state.is_settled() {
            error!(
                "Event processing for {} ended in {} state; settling",
                repository,
                current_state.name()
            );
            current_state = current_state.settle();
        }
        self.state = current_state;

        info!("Final state for {}: {:?}", repository, self.state.status());

        for notice in &notices {
            self.notices.dispatch(repository.clone(), notice.clone());
        }

        Resolution {
            status: self.state.status(),
            reason: reason.unwrap_or(Reason::Ignored(IgnoreReason::UnexpectedEvent)),
            notices,
        }
    }
}

//! Explicit per-repository state machine.
//!
//! This module implements a state machine pattern where:
//! - State is explicit and typed (not scattered across variables)
//! - Transitions are pure functions: `(State, Event) -> (State, Vec<Effect>)`
//! - Effects are data, executed by an interpreter against the gateway
//! - Each repository is owned by one worker task that applies events in order

pub mod effect;
pub mod event;
pub mod interpreter;
pub mod outcome;
pub mod state;
pub mod transition;
pub mod worker;

pub use effect::{Effect, LogLevel, Notice};
pub use event::{CiReport, CiStatus, Event, Operation};
pub use outcome::{IgnoreReason, Reason, ReconcileOutcome, Resolution};
pub use state::{
    AdmissionFailure, AttemptMode, CommitSha, IntegrationAttempt, QueueState, QueueStatus,
    RepositoryKey, Verdict,
};
pub use transition::{transition, TransitionResult};

//! Run-level error taxonomy.
//!
//! `NeedsInteraction` is deliberately absent here: a step that cannot proceed
//! without external input is control flow (`StepOutcome::Suspend`), not an
//! error. Everything in this enum ends a run with `status = error` and is
//! retried only on the next natural trigger.

use thiserror::Error;

/// A hard failure raised while validating or executing a flow step.
#[derive(Debug, Error)]
pub enum StepError {
    /// The flow or a step is malformed. Raised during validation, before any
    /// network I/O happens.
    #[error("invalid flow configuration: {0}")]
    Config(String),

    /// A step failed while executing (HTTP failure, malformed response,
    /// extraction blew up).
    #[error("step execution failed: {0}")]
    Step(String),

    /// Token exchange or refresh failed. A step error with an auth-specific
    /// message; recoverable, never fatal to the process.
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl StepError {
    pub fn config(msg: impl Into<String>) -> Self {
        StepError::Config(msg.into())
    }

    pub fn step(msg: impl Into<String>) -> Self {
        StepError::Step(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        StepError::Auth(msg.into())
    }
}

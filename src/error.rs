//! Engine error types.

use thiserror::Error;

/// Errors from the statechart engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed document '{name}': {reason}")]
    MalformedDocument { name: String, reason: String },

    #[error("unknown machine: no document installed under '{name}'")]
    UnknownMachine { name: String },

    #[error("machine '{name}' already started")]
    AlreadyStarted { name: String },

    #[error("ambiguous state id '{id}': non-unique ids must be qualified by parent path")]
    AmbiguousStateId { id: String },

    #[error("unknown state id: '{id}'")]
    UnknownStateId { id: String },

    #[error(
        "conflicting transitions on event '{event}': '{first}' and '{second}' touch overlapping states"
    )]
    ConflictingTransition {
        event: String,
        first: String,
        second: String,
    },
}

impl EngineError {
    /// Returns whether the caller can fix the condition and retry, e.g.
    /// install the missing document and look the machine up again.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::UnknownMachine { .. })
    }
}

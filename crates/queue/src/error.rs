//! Error types for the work queue.

use thiserror::Error;

use crate::state::QueueState;

/// Result type alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors that can occur in the work queue.
#[derive(Debug, Error)]
pub enum QueueError {
	/// A configuration option failed validation at construction.
	#[error("Invalid queue option '{option}': {reason}")]
	InvalidConfig {
		/// The offending option name.
		option: &'static str,
		/// What was wrong with it.
		reason: String,
	},

	/// The state machine refused a lifecycle transition. Queue state is
	/// unchanged.
	#[error("Invalid queue state transition: {from} -> {to}")]
	InvalidTransition { from: QueueState, to: QueueState },

	/// A task exceeded its configured processing budget.
	#[error("Task exceeded its {timeout_ms}ms processing budget")]
	TaskTimeout { timeout_ms: u64 },

	/// An underlying router operation failed.
	#[error(transparent)]
	Bus(#[from] relay::Error),
}

impl QueueError {
	/// Returns true if this error is a task timeout.
	pub fn is_timeout(&self) -> bool {
		matches!(self, QueueError::TaskTimeout { .. })
	}

	/// Returns true if this error is a refused state transition.
	pub fn is_invalid_transition(&self) -> bool {
		matches!(self, QueueError::InvalidTransition { .. })
	}
}

//! Error types for the event router.

use thiserror::Error;

/// Result type alias for router operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the event router.
#[derive(Debug, Error)]
pub enum Error {
	/// A selector or payload failed validation before the operation ran.
	/// Router state is unchanged.
	#[error("Invalid event '{event}': {reason}")]
	InvalidEvent {
		/// The offending selector key.
		event: String,
		/// What was wrong with it.
		reason: String,
	},

	/// The configured emission validator vetoed an `emit` call.
	#[error("Emission of '{event}' rejected: {reason}")]
	EmitRejected { event: String, reason: String },

	/// `next` or `emit` was called on a pull iterator after cancellation.
	#[error("Iterator destroyed: no further events can be pulled")]
	DestroyedIterator,

	/// A one-shot subscription was removed before a matching event arrived.
	#[error("Subscription detached before an event arrived")]
	Detached,
}

impl Error {
	/// Returns true if this error came from a cancelled pull iterator.
	pub fn is_destroyed(&self) -> bool {
		matches!(self, Error::DestroyedIterator)
	}

	/// Returns true if this error was a validation failure.
	pub fn is_invalid(&self) -> bool {
		matches!(self, Error::InvalidEvent { .. })
	}
}

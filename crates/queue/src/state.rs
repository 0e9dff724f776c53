//! Queue lifecycle state machine.
//!
//! Four states with a fixed transition table; every lifecycle operation is
//! guarded by [`StateMachine::transition`], which refuses anything the table
//! does not allow.

use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{QueueError, Result};

/// Lifecycle state of a work queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
	/// Workers pull and process buffered items.
	Running,
	/// Admission stays open; no new items are pulled.
	Paused,
	/// Admission closed, no workers.
	Stopped,
	/// Admission closed; remaining items are processed until empty.
	Draining,
}

impl QueueState {
	/// Returns true if the transition `self -> to` is allowed.
	pub fn can_transition(self, to: QueueState) -> bool {
		use QueueState::*;
		matches!(
			(self, to),
			(Stopped, Running)
				| (Stopped, Draining)
				| (Running, Paused)
				| (Running, Draining)
				| (Running, Stopped)
				| (Paused, Running)
				| (Paused, Draining)
				| (Paused, Stopped)
				| (Draining, Stopped)
				| (Draining, Paused)
		)
	}
}

impl fmt::Display for QueueState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			QueueState::Running => "running",
			QueueState::Paused => "paused",
			QueueState::Stopped => "stopped",
			QueueState::Draining => "draining",
		};
		f.write_str(name)
	}
}

/// Transition-table-guarded state holder.
pub(crate) struct StateMachine {
	current: Mutex<QueueState>,
}

impl StateMachine {
	/// New queues start stopped.
	pub fn new() -> Self {
		Self {
			current: Mutex::new(QueueState::Stopped),
		}
	}

	pub fn current(&self) -> QueueState {
		*self.current.lock()
	}

	/// Moves to `to` if the table allows it. Returns the previous state.
	///
	/// # Errors
	///
	/// Returns [`QueueError::InvalidTransition`] for a refused transition;
	/// the state is unchanged.
	pub fn transition(&self, to: QueueState) -> Result<QueueState> {
		let mut current = self.current.lock();
		if !current.can_transition(to) {
			return Err(QueueError::InvalidTransition { from: *current, to });
		}
		let previous = *current;
		*current = to;
		Ok(previous)
	}
}

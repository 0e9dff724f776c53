//! Queue lifecycle events and the sentinel envelope.
//!
//! Queue events travel through the same router the queue reads admissions
//! from, under `queue:<name>:<phase>` names. Every emitted payload is
//! wrapped in a [`QueueEvent`] envelope so that pattern subscribers and the
//! admission listener can tell queue output from user input and skip it;
//! without the sentinel a pattern like `^queue:` would feed the queue its
//! own lifecycle events.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::buffer::QueueItem;

/// Marker key identifying an envelope value.
pub const ENVELOPE_KEY: &str = "$queue";

/// Phase of a queue lifecycle event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueuePhase {
	Added,
	Start,
	Started,
	Stopped,
	Processing,
	Success,
	Error,
	Timeout,
	RateLimited,
	Empty,
	Idle,
	Rejected,
	Drain,
	Drained,
	Flush,
	Flushed,
	Paused,
	Resumed,
	Cleanup,
	Purged,
	Shutdown,
}

impl QueuePhase {
	pub fn as_str(&self) -> &'static str {
		match self {
			QueuePhase::Added => "added",
			QueuePhase::Start => "start",
			QueuePhase::Started => "started",
			QueuePhase::Stopped => "stopped",
			QueuePhase::Processing => "processing",
			QueuePhase::Success => "success",
			QueuePhase::Error => "error",
			QueuePhase::Timeout => "timeout",
			QueuePhase::RateLimited => "rate-limited",
			QueuePhase::Empty => "empty",
			QueuePhase::Idle => "idle",
			QueuePhase::Rejected => "rejected",
			QueuePhase::Drain => "drain",
			QueuePhase::Drained => "drained",
			QueuePhase::Flush => "flush",
			QueuePhase::Flushed => "flushed",
			QueuePhase::Paused => "paused",
			QueuePhase::Resumed => "resumed",
			QueuePhase::Cleanup => "cleanup",
			QueuePhase::Purged => "purged",
			QueuePhase::Shutdown => "shutdown",
		}
	}
}

impl fmt::Display for QueuePhase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Router event name for a queue phase: `queue:<name>:<phase>`.
pub fn event_name(queue: &str, phase: QueuePhase) -> String {
	format!("queue:{}:{}", queue, phase.as_str())
}

/// Sentinel envelope wrapped around every queue-emitted payload.
///
/// External subscribers read the inner payload from the `data` field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueEvent {
	/// Owning queue name, under the `$queue` marker key.
	#[serde(rename = "$queue")]
	pub queue: String,
	pub phase: QueuePhase,
	pub data: Value,
}

impl QueueEvent {
	/// Wraps a payload into an envelope value.
	pub fn wrap(queue: &str, phase: QueuePhase, data: Value) -> Value {
		serde_json::to_value(QueueEvent {
			queue: queue.to_string(),
			phase,
			data,
		})
		.expect("queue envelope always serialises")
	}

	/// Returns true if the value is a queue envelope.
	pub fn is_envelope(value: &Value) -> bool {
		value
			.as_object()
			.is_some_and(|object| object.contains_key(ENVELOPE_KEY))
	}

	/// Parses an envelope back out of a value.
	pub fn unwrap(value: &Value) -> Option<QueueEvent> {
		if !Self::is_envelope(value) {
			return None;
		}
		serde_json::from_value(value.clone()).ok()
	}
}

/// Why an admission was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
	/// The buffer was at `maxQueueSize`.
	Full,
	/// The queue was not accepting admissions.
	NotRunning,
}

/// Payload of a `rejected` event.
#[derive(Clone, Debug, Serialize)]
pub struct RejectedEvent {
	pub reason: RejectReason,
	pub data: Value,
}

/// Payload of the per-task phases (`added`, `processing`, `success`,
/// `error`, `timeout`, `rate-limited`).
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
	pub item: QueueItem,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub started_at_ms: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub elapsed_ms: Option<u64>,
	pub rate_limited: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl TaskEvent {
	/// Payload carrying just the item.
	pub fn item(item: QueueItem) -> Self {
		Self {
			item,
			started_at_ms: None,
			elapsed_ms: None,
			rate_limited: false,
			error: None,
		}
	}
}

/// Payload of the counted phases (`drained`, `flushed`, `purged`,
/// `shutdown`).
#[derive(Clone, Copy, Debug, Serialize)]
pub struct CountEvent {
	pub count: usize,
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::buffer::TaskId;
	use serde_json::json;

	#[test]
	fn test_event_names_are_namespaced() {
		assert_eq!(event_name("mailer", QueuePhase::Success), "queue:mailer:success");
		assert_eq!(
			event_name("mailer", QueuePhase::RateLimited),
			"queue:mailer:rate-limited"
		);
	}

	#[test]
	fn test_envelope_round_trip() {
		let wrapped = QueueEvent::wrap("q", QueuePhase::Added, json!({"n": 1}));
		assert!(QueueEvent::is_envelope(&wrapped));

		let event = QueueEvent::unwrap(&wrapped).unwrap();
		assert_eq!(event.queue, "q");
		assert_eq!(event.phase, QueuePhase::Added);
		assert_eq!(event.data, json!({"n": 1}));
	}

	#[test]
	fn test_plain_payloads_are_not_envelopes() {
		assert!(!QueueEvent::is_envelope(&json!({"data": 1})));
		assert!(!QueueEvent::is_envelope(&json!(7)));
		assert!(!QueueEvent::is_envelope(&json!(null)));
	}

	#[test]
	fn test_task_event_serialises_camel_case() {
		let payload = TaskEvent {
			item: crate::buffer::QueueItem {
				id: TaskId::next(),
				data: json!("x"),
				priority: 0,
			},
			started_at_ms: Some(5),
			elapsed_ms: Some(2),
			rate_limited: true,
			error: None,
		};
		let value = serde_json::to_value(payload).unwrap();
		assert!(value.get("startedAtMs").is_some());
		assert!(value.get("elapsedMs").is_some());
		assert_eq!(value["rateLimited"], json!(true));
		assert!(value.get("error").is_none());
	}
}

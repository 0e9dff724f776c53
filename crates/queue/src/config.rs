//! Work queue configuration.
//!
//! Every option is validated at construction; violations fail loudly with
//! [`QueueError::InvalidConfig`] and are never silently coerced.

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

/// Tie-break discipline for items of equal priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
	/// Equal-priority items are served oldest first.
	Fifo,
	/// Equal-priority items are served newest first.
	Lifo,
}

/// Verbosity of queue phase logging through `tracing`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugLevel {
	/// No phase logging.
	Off,
	/// Log phase names.
	Info,
	/// Log phase names and payloads.
	Verbose,
}

/// Work queue options.
///
/// Built with [`QueueConfig::new`] plus chainable setters:
///
/// ```ignore
/// let config = QueueConfig::new("mailer")
///     .concurrency(2)
///     .max_queue_size(64)
///     .rate_limit(1, 50);
/// ```
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
	/// Non-empty identifier; namespaces emitted events as
	/// `queue:<name>:<phase>`.
	pub name: String,
	/// Tie-break discipline within equal priority.
	pub kind: QueueKind,
	/// Workers launched per generation.
	pub concurrency: usize,
	/// Wait between empty-queue polls.
	pub poll_interval_ms: u64,
	/// Multiplicative random jitter on the polling wait, in `[0, 1]`.
	pub jitter_factor: f64,
	/// Mandatory pause between successive tasks on one worker.
	pub process_interval_ms: u64,
	/// Per-task processing budget. 0 disables the timeout.
	pub task_timeout_ms: u64,
	/// Hard bound on buffered items; admission beyond it is rejected.
	pub max_queue_size: usize,
	/// Token bucket capacity. 0 disables rate limiting.
	pub rate_limit_capacity: u32,
	/// Token bucket refill interval.
	pub rate_limit_interval_ms: u64,
	/// Start the queue at construction.
	pub auto_start: bool,
	/// Phase logging verbosity.
	pub debug: DebugLevel,
}

impl QueueConfig {
	/// Configuration with defaults: FIFO, one worker, 100ms polls, no
	/// jitter, no inter-task pause, no timeout, 10000-item bound, no rate
	/// limiting, manual start, logging off.
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			kind: QueueKind::Fifo,
			concurrency: 1,
			poll_interval_ms: 100,
			jitter_factor: 0.0,
			process_interval_ms: 0,
			task_timeout_ms: 0,
			max_queue_size: 10_000,
			rate_limit_capacity: 0,
			rate_limit_interval_ms: 0,
			auto_start: false,
			debug: DebugLevel::Off,
		}
	}

	pub fn kind(mut self, kind: QueueKind) -> Self {
		self.kind = kind;
		self
	}

	pub fn concurrency(mut self, concurrency: usize) -> Self {
		self.concurrency = concurrency;
		self
	}

	pub fn poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
		self.poll_interval_ms = poll_interval_ms;
		self
	}

	pub fn jitter_factor(mut self, jitter_factor: f64) -> Self {
		self.jitter_factor = jitter_factor;
		self
	}

	pub fn process_interval_ms(mut self, process_interval_ms: u64) -> Self {
		self.process_interval_ms = process_interval_ms;
		self
	}

	pub fn task_timeout_ms(mut self, task_timeout_ms: u64) -> Self {
		self.task_timeout_ms = task_timeout_ms;
		self
	}

	pub fn max_queue_size(mut self, max_queue_size: usize) -> Self {
		self.max_queue_size = max_queue_size;
		self
	}

	/// Sets both token bucket parameters.
	pub fn rate_limit(mut self, capacity: u32, interval_ms: u64) -> Self {
		self.rate_limit_capacity = capacity;
		self.rate_limit_interval_ms = interval_ms;
		self
	}

	pub fn auto_start(mut self, auto_start: bool) -> Self {
		self.auto_start = auto_start;
		self
	}

	pub fn debug(mut self, debug: DebugLevel) -> Self {
		self.debug = debug;
		self
	}

	/// Validates every option.
	///
	/// # Errors
	///
	/// Returns [`QueueError::InvalidConfig`] naming the first violated
	/// option.
	pub fn validate(&self) -> Result<()> {
		if self.name.is_empty() {
			return Err(QueueError::InvalidConfig {
				option: "name",
				reason: "must be a non-empty identifier".to_string(),
			});
		}
		if self.concurrency == 0 {
			return Err(QueueError::InvalidConfig {
				option: "concurrency",
				reason: "must be at least 1".to_string(),
			});
		}
		if self.poll_interval_ms == 0 {
			return Err(QueueError::InvalidConfig {
				option: "pollIntervalMs",
				reason: "must be at least 1".to_string(),
			});
		}
		if !self.jitter_factor.is_finite() || !(0.0..=1.0).contains(&self.jitter_factor) {
			return Err(QueueError::InvalidConfig {
				option: "jitterFactor",
				reason: format!("must be within [0, 1], got {}", self.jitter_factor),
			});
		}
		if self.max_queue_size == 0 {
			return Err(QueueError::InvalidConfig {
				option: "maxQueueSize",
				reason: "must be at least 1".to_string(),
			});
		}
		if self.rate_limit_capacity > 0 && self.rate_limit_interval_ms == 0 {
			return Err(QueueError::InvalidConfig {
				option: "rateLimitIntervalMs",
				reason: "must be at least 1 when rate limiting is enabled".to_string(),
			});
		}
		Ok(())
	}
}

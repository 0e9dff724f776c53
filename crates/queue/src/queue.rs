//! The event-driven work queue.
//!
//! A [`WorkQueue`] binds a router and a chosen event to a user-supplied
//! processing function. Admission flows through the router: `add` emits the
//! bound event, and the queue's own listener intercepts the emission and
//! buffers `{task-id, data, priority}`. External emissions of the bound
//! event are admitted the same way at priority 0. Lifecycle events are
//! emitted back through the router under `queue:<name>:<phase>`, wrapped in
//! the sentinel envelope so they can never re-admit themselves.
//!
//! Workers are tokio tasks guarded by a generation number: every (re)launch
//! bumps the generation, and a worker exits as soon as it observes that the
//! generation advanced or the state left running.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use relay::{ChildObserver, Event, EventRouter, Selector, Subscription};

use crate::buffer::{PriorityBuffer, QueueItem, TaskId};
use crate::config::{DebugLevel, QueueConfig};
use crate::error::{QueueError, Result};
use crate::events::{
	CountEvent, QueueEvent, QueuePhase, RejectReason, RejectedEvent, TaskEvent, event_name,
};
use crate::limiter::{LimiterSnapshot, RateLimiter};
use crate::state::{QueueState, StateMachine};
use crate::stats::{QueueStats, StatsCollector};

/// Boxed task future.
pub type TaskFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// The processing function a queue drives.
pub type TaskFn = Arc<dyn Fn(Value) -> TaskFuture + Send + Sync>;

/// Wraps an async closure into a [`TaskFn`].
pub fn task_fn<F, Fut>(f: F) -> TaskFn
where
	F: Fn(Value) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
	Arc::new(move |data| -> TaskFuture { Box::pin(f(data)) })
}

/// Composite read-only view of a queue.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
	pub name: String,
	pub state: QueueState,
	pub pending: usize,
	pub active: usize,
	pub stats: QueueStats,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub rate_limiter: Option<LimiterSnapshot>,
}

struct PendingAdd {
	priority: i64,
	accepted: bool,
}

struct QueueInner {
	router: EventRouter,
	selector: Selector,
	config: QueueConfig,
	task: TaskFn,
	state: StateMachine,
	buffer: Mutex<PriorityBuffer>,
	limiter: Option<RateLimiter>,
	stats: StatsCollector,
	/// Owns the stats listener bundle; dropped with the queue.
	_observer: ChildObserver,
	admission: Mutex<Option<Subscription>>,
	/// Serialises `add` calls across the synchronous emit round-trip.
	add_gate: Mutex<()>,
	pending_add: Mutex<Option<PendingAdd>>,
	generation: AtomicU64,
	active: AtomicUsize,
	idle: AtomicBool,
}

impl QueueInner {
	fn emit_phase(&self, phase: QueuePhase, data: Value) {
		let envelope = QueueEvent::wrap(&self.config.name, phase, data);
		match self.config.debug {
			DebugLevel::Off => {}
			DebugLevel::Info => {
				tracing::info!(queue = %self.config.name, phase = %phase, "queue event");
			}
			DebugLevel::Verbose => {
				tracing::info!(
					queue = %self.config.name,
					phase = %phase,
					payload = %envelope,
					"queue event"
				);
			}
		}
		let name = event_name(&self.config.name, phase);
		if let Err(error) = self.router.emit(name.as_str(), envelope) {
			tracing::warn!(
				queue = %self.config.name,
				phase = %phase,
				error = %error,
				"queue event emission failed"
			);
		}
	}

	fn payload<T: Serialize>(value: &T) -> Value {
		serde_json::to_value(value).unwrap_or(Value::Null)
	}

	/// Admission listener body: runs synchronously inside emissions of the
	/// bound event.
	fn admit(&self, event: Event) {
		if QueueEvent::is_envelope(&event.data) {
			// The queue's own lifecycle output, matched back by a pattern
			// selector. Never self-admit.
			return;
		}
		let priority = self
			.pending_add
			.lock()
			.as_ref()
			.map(|pending| pending.priority)
			.unwrap_or(0);

		let state = self.state.current();
		if !matches!(state, QueueState::Running | QueueState::Paused) {
			self.emit_phase(
				QueuePhase::Rejected,
				Self::payload(&RejectedEvent {
					reason: RejectReason::NotRunning,
					data: event.data,
				}),
			);
			self.finish_add(false);
			return;
		}

		let item = {
			let mut buffer = self.buffer.lock();
			if buffer.len() >= self.config.max_queue_size {
				None
			} else {
				let item = QueueItem {
					id: TaskId::next(),
					data: event.data.clone(),
					priority,
				};
				buffer.push(item.clone());
				Some(item)
			}
		};

		match item {
			Some(item) => {
				self.idle.store(false, Ordering::SeqCst);
				self.emit_phase(QueuePhase::Added, Self::payload(&TaskEvent::item(item)));
				self.finish_add(true);
			}
			None => {
				self.emit_phase(
					QueuePhase::Rejected,
					Self::payload(&RejectedEvent {
						reason: RejectReason::Full,
						data: event.data,
					}),
				);
				self.finish_add(false);
			}
		}
	}

	fn finish_add(&self, accepted: bool) {
		if let Some(pending) = self.pending_add.lock().as_mut() {
			pending.accepted = accepted;
		}
	}

	fn poll_wait(&self) -> Duration {
		let base = self.config.poll_interval_ms as f64;
		let jitter = if self.config.jitter_factor > 0.0 {
			1.0 + rand::random::<f64>() * self.config.jitter_factor
		} else {
			1.0
		};
		Duration::from_millis((base * jitter).round() as u64)
	}

	/// Runs one item through the processing function, emitting the
	/// `processing`/`success`/`error`/`timeout` phases. Draining bypasses
	/// the rate limiter.
	async fn process_item(&self, item: QueueItem, draining: bool) {
		self.active.fetch_add(1, Ordering::SeqCst);

		let rate_limited = if draining {
			false
		} else if let Some(limiter) = &self.limiter {
			limiter
				.acquire_with(|| {
					self.emit_phase(
						QueuePhase::RateLimited,
						Self::payload(&TaskEvent::item(item.clone())),
					);
				})
				.await
		} else {
			false
		};

		let started = tokio::time::Instant::now();
		let started_at_ms = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_millis() as u64)
			.unwrap_or(0);
		self.emit_phase(
			QueuePhase::Processing,
			Self::payload(&TaskEvent {
				item: item.clone(),
				started_at_ms: Some(started_at_ms),
				elapsed_ms: None,
				rate_limited,
				error: None,
			}),
		);

		let future = (self.task)(item.data.clone());
		let outcome = if self.config.task_timeout_ms > 0 {
			let budget = Duration::from_millis(self.config.task_timeout_ms);
			match tokio::time::timeout(budget, future).await {
				Ok(outcome) => outcome,
				Err(_) => {
					self.emit_phase(
						QueuePhase::Timeout,
						Self::payload(&TaskEvent {
							item: item.clone(),
							started_at_ms: Some(started_at_ms),
							elapsed_ms: Some(started.elapsed().as_millis() as u64),
							rate_limited,
							error: None,
						}),
					);
					Err(QueueError::TaskTimeout {
						timeout_ms: self.config.task_timeout_ms,
					}
					.into())
				}
			}
		} else {
			future.await
		};

		let elapsed_ms = started.elapsed().as_millis() as u64;
		self.active.fetch_sub(1, Ordering::SeqCst);

		match outcome {
			Ok(_) => {
				self.emit_phase(
					QueuePhase::Success,
					Self::payload(&TaskEvent {
						item,
						started_at_ms: Some(started_at_ms),
						elapsed_ms: Some(elapsed_ms),
						rate_limited,
						error: None,
					}),
				);
			}
			Err(error) => {
				self.emit_phase(
					QueuePhase::Error,
					Self::payload(&TaskEvent {
						item,
						started_at_ms: Some(started_at_ms),
						elapsed_ms: Some(elapsed_ms),
						rate_limited,
						error: Some(error.to_string()),
					}),
				);
			}
		}
	}
}

async fn worker_loop(inner: Arc<QueueInner>, generation: u64, index: usize) {
	tracing::debug!(
		queue = %inner.config.name,
		generation,
		worker = index,
		"worker started"
	);
	loop {
		if inner.generation.load(Ordering::SeqCst) != generation {
			break;
		}
		if inner.state.current() != QueueState::Running {
			break;
		}

		let item = inner.buffer.lock().pop();
		let Some(item) = item else {
			if !inner.idle.swap(true, Ordering::SeqCst) {
				inner.emit_phase(QueuePhase::Idle, Value::Null);
			}
			tokio::time::sleep(inner.poll_wait()).await;
			continue;
		};

		// The pop raced a lifecycle change: give the item back untouched.
		let state = inner.state.current();
		if !matches!(state, QueueState::Running | QueueState::Draining) {
			inner.buffer.lock().requeue(item);
			continue;
		}

		inner.process_item(item, false).await;

		if inner.buffer.lock().is_empty() && inner.state.current() == QueueState::Running {
			inner.emit_phase(QueuePhase::Empty, Value::Null);
		}
		if inner.config.process_interval_ms > 0 {
			tokio::time::sleep(Duration::from_millis(inner.config.process_interval_ms)).await;
		}
	}
	tracing::debug!(
		queue = %inner.config.name,
		generation,
		worker = index,
		"worker exited"
	);
}

/// Event-driven work queue over an [`EventRouter`].
pub struct WorkQueue {
	inner: Arc<QueueInner>,
}

impl WorkQueue {
	/// Binds a router, a selector, and a processing function under the
	/// given configuration.
	///
	/// # Errors
	///
	/// Returns [`QueueError::InvalidConfig`] for a rejected option and
	/// propagates router errors for an invalid selector. With `auto_start`,
	/// start errors surface here as well.
	pub fn new(
		router: EventRouter,
		selector: impl Into<Selector>,
		task: TaskFn,
		config: QueueConfig,
	) -> Result<Self> {
		config.validate()?;
		let selector = selector.into();
		selector.validate().map_err(QueueError::from)?;

		let observer = router.observer();
		let stats = StatsCollector::attach(&observer, &config.name)?;
		let limiter = (config.rate_limit_capacity > 0)
			.then(|| RateLimiter::new(config.rate_limit_capacity, config.rate_limit_interval_ms));

		let inner = Arc::new(QueueInner {
			router,
			selector,
			buffer: Mutex::new(PriorityBuffer::new(config.kind)),
			limiter,
			stats,
			_observer: observer,
			admission: Mutex::new(None),
			add_gate: Mutex::new(()),
			pending_add: Mutex::new(None),
			generation: AtomicU64::new(0),
			active: AtomicUsize::new(0),
			idle: AtomicBool::new(false),
			state: StateMachine::new(),
			task,
			config,
		});

		let queue = Self { inner };
		if queue.inner.config.auto_start {
			queue.start()?;
		}
		Ok(queue)
	}

	/// The queue's configured name.
	pub fn name(&self) -> &str {
		&self.inner.config.name
	}

	/// Current lifecycle state.
	pub fn state(&self) -> QueueState {
		self.inner.state.current()
	}

	/// Number of buffered items.
	pub fn pending(&self) -> usize {
		self.inner.buffer.lock().len()
	}

	/// Cloned statistics snapshot.
	pub fn stats(&self) -> QueueStats {
		self.inner.stats.snapshot()
	}

	/// Number of workers currently processing a task.
	pub fn active(&self) -> usize {
		self.inner.active.load(Ordering::SeqCst)
	}

	/// Composite snapshot of state, pending count, stats, runners, and the
	/// rate limiter.
	pub fn snapshot(&self) -> QueueSnapshot {
		QueueSnapshot {
			name: self.inner.config.name.clone(),
			state: self.state(),
			pending: self.pending(),
			active: self.active(),
			stats: self.stats(),
			rate_limiter: self.inner.limiter.as_ref().map(RateLimiter::snapshot),
		}
	}

	/// Admits a payload at priority 0. See
	/// [`add_with_priority`](Self::add_with_priority).
	pub fn add(&self, data: Value) -> bool {
		self.add_with_priority(data, 0)
	}

	/// Admits a payload by emitting the bound event; the queue's admission
	/// listener buffers it at the given priority. Returns false (after a
	/// `rejected` event) when the buffer is full or the queue is not
	/// accepting admissions. Rejection is signalled, never thrown.
	pub fn add_with_priority(&self, data: Value, priority: i64) -> bool {
		let _gate = self.inner.add_gate.lock();
		*self.inner.pending_add.lock() = Some(PendingAdd {
			priority,
			accepted: false,
		});
		let emitted = self.inner.router.emit(&self.inner.selector, data.clone());
		let accepted = self
			.inner
			.pending_add
			.lock()
			.take()
			.map(|pending| pending.accepted)
			.unwrap_or(false);
		if let Err(error) = emitted {
			tracing::warn!(queue = %self.inner.config.name, error = %error, "admission emit failed");
			return false;
		}
		if !accepted && self.inner.admission.lock().is_none() {
			// No listener installed (stopped or draining): the rejection is
			// reported here instead.
			self.inner.emit_phase(
				QueuePhase::Rejected,
				QueueInner::payload(&RejectedEvent {
					reason: RejectReason::NotRunning,
					data,
				}),
			);
		}
		accepted
	}

	fn install_admission(&self) -> Result<()> {
		let mut slot = self.inner.admission.lock();
		if slot.is_some() {
			return Ok(());
		}
		let weak = Arc::downgrade(&self.inner);
		let subscription = self
			.inner
			.router
			.on(&self.inner.selector, move |event: Event| {
				if let Some(inner) = weak.upgrade() {
					inner.admit(event);
				}
			})?;
		*slot = Some(subscription);
		Ok(())
	}

	fn remove_admission(&self) {
		if let Some(subscription) = self.inner.admission.lock().take() {
			subscription.unsubscribe();
		}
	}

	fn spawn_workers(&self) {
		let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
		for index in 0..self.inner.config.concurrency {
			let inner = Arc::clone(&self.inner);
			tokio::spawn(worker_loop(inner, generation, index));
		}
	}

	/// Transitions stopped -> running, installs the admission listener, and
	/// launches a new worker generation. No-op if already running.
	pub fn start(&self) -> Result<()> {
		if self.state() == QueueState::Running {
			return Ok(());
		}
		self.inner.state.transition(QueueState::Running)?;
		self.install_admission()?;
		self.inner.idle.store(false, Ordering::SeqCst);
		self.spawn_workers();
		self.inner.emit_phase(QueuePhase::Start, Value::Null);
		self.inner.emit_phase(QueuePhase::Started, Value::Null);
		Ok(())
	}

	/// Transitions to paused. Admission stays open; workers finish their
	/// current task and stop pulling. No new generation is issued.
	pub fn pause(&self) -> Result<()> {
		self.inner.state.transition(QueueState::Paused)?;
		self.inner.emit_phase(QueuePhase::Paused, Value::Null);
		Ok(())
	}

	/// Re-installs the admission listener if necessary, transitions to
	/// running, and launches a new worker generation. No-op if already
	/// running.
	pub fn resume(&self) -> Result<()> {
		if self.state() == QueueState::Running {
			return Ok(());
		}
		self.install_admission()?;
		self.inner.state.transition(QueueState::Running)?;
		self.inner.idle.store(false, Ordering::SeqCst);
		self.spawn_workers();
		self.inner.emit_phase(QueuePhase::Resumed, Value::Null);
		Ok(())
	}

	/// Removes the admission listener, transitions to stopped, and retires
	/// the active worker generation.
	pub fn stop(&self) -> Result<()> {
		self.remove_admission();
		self.inner.state.transition(QueueState::Stopped)?;
		self.inner.generation.fetch_add(1, Ordering::SeqCst);
		self.inner.emit_phase(QueuePhase::Stopped, Value::Null);
		Ok(())
	}

	/// Graceful: pauses, transitions to draining, processes the remaining
	/// buffer sequentially (bypassing the rate limiter), stops, and returns
	/// how many items were drained. Forced: purges the buffer, stops, and
	/// returns how many items were dropped. Returns 0 when already draining
	/// or stopped.
	pub async fn shutdown(&self, force: bool) -> usize {
		let state = self.state();
		if matches!(state, QueueState::Draining | QueueState::Stopped) {
			return 0;
		}

		if force {
			let dropped = self.inner.buffer.lock().clear();
			self.remove_admission();
			let _ = self.inner.state.transition(QueueState::Stopped);
			self.inner.generation.fetch_add(1, Ordering::SeqCst);
			self.inner.emit_phase(QueuePhase::Cleanup, Value::Null);
			self.inner
				.emit_phase(QueuePhase::Shutdown, QueueInner::payload(&CountEvent { count: dropped }));
			return dropped;
		}

		if state == QueueState::Running {
			let _ = self.inner.state.transition(QueueState::Paused);
		}
		if self.inner.state.transition(QueueState::Draining).is_err() {
			return 0;
		}
		self.inner.generation.fetch_add(1, Ordering::SeqCst);
		self.remove_admission();
		self.inner.emit_phase(QueuePhase::Drain, Value::Null);

		let mut count = 0;
		loop {
			let item = self.inner.buffer.lock().pop();
			match item {
				Some(item) => {
					self.inner.process_item(item, true).await;
					count += 1;
				}
				None => break,
			}
		}

		self.inner
			.emit_phase(QueuePhase::Drained, QueueInner::payload(&CountEvent { count }));
		let _ = self.inner.state.transition(QueueState::Stopped);
		self.inner.emit_phase(QueuePhase::Cleanup, Value::Null);
		self.inner
			.emit_phase(QueuePhase::Shutdown, QueueInner::payload(&CountEvent { count }));
		count
	}

	/// Pops up to `limit` items and processes them sequentially on the
	/// caller's task, bypassing the rate limiter. Returns how many were
	/// processed.
	pub async fn flush(&self, limit: Option<usize>) -> usize {
		self.inner.emit_phase(QueuePhase::Flush, Value::Null);
		let items = self
			.inner
			.buffer
			.lock()
			.pop_many(limit.unwrap_or(usize::MAX));
		let mut count = 0;
		for item in items {
			self.inner.process_item(item, true).await;
			count += 1;
		}
		self.inner
			.emit_phase(QueuePhase::Flushed, QueueInner::payload(&CountEvent { count }));
		count
	}

	/// Discards every buffered item. Returns how many were dropped.
	pub fn purge(&self) -> usize {
		let count = self.inner.buffer.lock().clear();
		self.inner
			.emit_phase(QueuePhase::Purged, QueueInner::payload(&CountEvent { count }));
		count
	}

	/// Subscribes to one of this queue's namespaced phase events.
	pub fn on<F>(&self, phase: QueuePhase, callback: F) -> Result<Subscription>
	where
		F: Fn(Event) + Send + Sync + 'static,
	{
		let name = event_name(&self.inner.config.name, phase);
		Ok(self.inner.router.on(name.as_str(), callback)?)
	}

	/// One-shot variant of [`on`](Self::on).
	pub fn once<F>(&self, phase: QueuePhase, callback: F) -> Result<Subscription>
	where
		F: Fn(Event) + Send + Sync + 'static,
	{
		let name = event_name(&self.inner.config.name, phase);
		Ok(self.inner.router.once(name.as_str(), callback)?)
	}

	/// Removes every subscriber of one of this queue's phase events.
	pub fn off(&self, phase: QueuePhase) -> Result<()> {
		let name = event_name(&self.inner.config.name, phase);
		Ok(self.inner.router.off(name.as_str())?)
	}
}

impl Drop for WorkQueue {
	fn drop(&mut self) {
		// Retire any workers still holding the inner Arc.
		self.inner.generation.fetch_add(1, Ordering::SeqCst);
	}
}

impl std::fmt::Debug for WorkQueue {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("WorkQueue")
			.field("name", &self.inner.config.name)
			.field("state", &self.state())
			.field("pending", &self.pending())
			.field("active", &self.active())
			.finish()
	}
}

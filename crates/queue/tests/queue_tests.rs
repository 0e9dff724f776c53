//! End-to-end queue behaviour: admission, rate limiting, timeouts,
//! priorities, lifecycle, and statistics. All timing runs on the paused
//! tokio clock, so duration assertions are deterministic.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use serde_json::{Value, json};

use relay::EventRouter;
use relay_queue::{
	QueueConfig, QueueKind, QueuePhase, QueueState, WorkQueue, task_fn,
};

/// Processing function that succeeds immediately, echoing its input.
fn echo() -> relay_queue::TaskFn {
	task_fn(|data| async move { Ok(data) })
}

/// Processing function that sleeps for `ms` before succeeding.
fn sleeper(ms: u64) -> relay_queue::TaskFn {
	task_fn(move |data| async move {
		tokio::time::sleep(Duration::from_millis(ms)).await;
		Ok(data)
	})
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
	for _ in 0..2000 {
		if condition() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	panic!("condition not reached in time");
}

/// Item payload buried in an envelope: `data.item.data`.
fn item_data(envelope: &Value) -> Value {
	envelope["data"]["item"]["data"].clone()
}

#[tokio::test(start_paused = true)]
async fn capacity_rate_limit_and_rejection_interplay() {
	let router = EventRouter::new();
	let queue = WorkQueue::new(
		router.clone(),
		"job",
		echo(),
		QueueConfig::new("crowded")
			.concurrency(2)
			.max_queue_size(3)
			.rate_limit(1, 50),
	)
	.unwrap();

	let rejections = Arc::new(Mutex::new(Vec::new()));
	let rejections_clone = Arc::clone(&rejections);
	let _rej = queue
		.on(QueuePhase::Rejected, move |event| {
			rejections_clone.lock().push(event.data["data"]["reason"].clone());
		})
		.unwrap();

	let processing_times = Arc::new(Mutex::new(Vec::new()));
	let times_clone = Arc::clone(&processing_times);
	let _proc = queue
		.on(QueuePhase::Processing, move |_event| {
			times_clone.lock().push(tokio::time::Instant::now());
		})
		.unwrap();

	let throttles = Arc::new(Mutex::new(0usize));
	let throttles_clone = Arc::clone(&throttles);
	let _rate = queue
		.on(QueuePhase::RateLimited, move |_event| {
			*throttles_clone.lock() += 1;
		})
		.unwrap();

	queue.start().unwrap();
	// Workers cannot interleave before the first await, so all five
	// admissions race against a capacity of three.
	let accepted: Vec<bool> = (1..=5).map(|n| queue.add(json!({"p": n}))).collect();
	assert_eq!(accepted.iter().filter(|a| **a).count(), 3);

	wait_for(|| queue.stats().success == 3).await;

	let stats = queue.stats();
	assert_eq!(stats.success, 3);
	assert_eq!(stats.rejected, 2);
	assert_eq!(*rejections.lock(), vec![json!("full"), json!("full")]);
	assert!(*throttles.lock() >= 1);

	// Consecutive task starts are separated by at least one refill interval.
	let times = processing_times.lock();
	assert_eq!(times.len(), 3);
	for pair in times.windows(2) {
		assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(40));
	}
}

#[tokio::test(start_paused = true)]
async fn task_timeout_emits_timeout_then_error_and_queue_keeps_running() {
	let router = EventRouter::new();
	let queue = WorkQueue::new(
		router.clone(),
		"slow",
		sleeper(100),
		QueueConfig::new("impatient").task_timeout_ms(20),
	)
	.unwrap();

	let timeouts = Arc::new(Mutex::new(0usize));
	let timeouts_clone = Arc::clone(&timeouts);
	let _t = queue
		.on(QueuePhase::Timeout, move |_event| {
			*timeouts_clone.lock() += 1;
		})
		.unwrap();

	let errors = Arc::new(Mutex::new(Vec::new()));
	let errors_clone = Arc::clone(&errors);
	let _e = queue
		.on(QueuePhase::Error, move |event| {
			errors_clone.lock().push(event.data["data"]["error"].clone());
		})
		.unwrap();

	queue.start().unwrap();
	assert!(queue.add(json!("doomed")));

	wait_for(|| queue.stats().error == 1).await;

	assert_eq!(*timeouts.lock(), 1);
	let errors = errors.lock();
	assert_eq!(errors.len(), 1);
	assert!(errors[0].as_str().unwrap().contains("20ms"));
	assert_eq!(queue.stats().success, 0);
	assert_eq!(queue.state(), QueueState::Running);
}

#[tokio::test(start_paused = true)]
async fn priorities_order_processing_with_fifo_tiebreak() {
	let router = EventRouter::new();
	let queue = WorkQueue::new(
		router.clone(),
		"prio",
		echo(),
		QueueConfig::new("ordered").kind(QueueKind::Fifo),
	)
	.unwrap();

	let order = Arc::new(Mutex::new(Vec::new()));
	let order_clone = Arc::clone(&order);
	let _p = queue
		.on(QueuePhase::Processing, move |event| {
			order_clone.lock().push(item_data(&event.data));
		})
		.unwrap();

	// Buffer everything while paused, then let one worker serve in order.
	queue.start().unwrap();
	queue.pause().unwrap();
	assert!(queue.add_with_priority(json!("P1"), 0));
	assert!(queue.add_with_priority(json!("P2"), 0));
	assert!(queue.add_with_priority(json!("P3"), 5));
	assert!(queue.add_with_priority(json!("P4"), 0));
	queue.resume().unwrap();

	wait_for(|| queue.stats().success == 4).await;

	assert_eq!(
		*order.lock(),
		vec![json!("P3"), json!("P1"), json!("P2"), json!("P4")]
	);
}

#[tokio::test(start_paused = true)]
async fn single_slot_buffer_rejects_until_drained() {
	let router = EventRouter::new();
	let queue = WorkQueue::new(
		router.clone(),
		"tight",
		echo(),
		QueueConfig::new("narrow").max_queue_size(1),
	)
	.unwrap();

	queue.start().unwrap();
	queue.pause().unwrap();
	assert!(queue.add(json!(1)));
	assert!(!queue.add(json!(2)));
	assert_eq!(queue.pending(), 1);

	queue.resume().unwrap();
	wait_for(|| queue.stats().success == 1).await;

	assert!(queue.add(json!(3)));
}

#[tokio::test(start_paused = true)]
async fn graceful_shutdown_drains_everything_and_stops() {
	let router = EventRouter::new();
	let queue = WorkQueue::new(router.clone(), "work", echo(), QueueConfig::new("drainer"))
		.unwrap();

	let phases = Arc::new(Mutex::new(Vec::new()));
	for phase in [QueuePhase::Drain, QueuePhase::Drained, QueuePhase::Shutdown] {
		let phases_clone = Arc::clone(&phases);
		queue
			.on(phase, move |_event| phases_clone.lock().push(phase))
			.unwrap()
			.forget();
	}

	queue.start().unwrap();
	queue.pause().unwrap();
	for n in 0..3 {
		assert!(queue.add(json!(n)));
	}
	let before = queue.stats().processed;

	let drained = queue.shutdown(false).await;

	assert_eq!(drained, 3);
	assert_eq!(queue.stats().processed - before, 3);
	assert_eq!(queue.state(), QueueState::Stopped);
	assert_eq!(queue.pending(), 0);
	assert_eq!(
		*phases.lock(),
		vec![QueuePhase::Drain, QueuePhase::Drained, QueuePhase::Shutdown]
	);

	// Already stopped: a second shutdown is a no-op.
	assert_eq!(queue.shutdown(false).await, 0);
}

#[tokio::test(start_paused = true)]
async fn forced_shutdown_drops_pending_without_processing() {
	let router = EventRouter::new();
	let queue = WorkQueue::new(router.clone(), "work", echo(), QueueConfig::new("forced"))
		.unwrap();

	queue.start().unwrap();
	queue.pause().unwrap();
	for n in 0..3 {
		assert!(queue.add(json!(n)));
	}

	let dropped = queue.shutdown(true).await;

	assert_eq!(dropped, 3);
	assert_eq!(queue.stats().processed, 0);
	assert_eq!(queue.state(), QueueState::Stopped);
	assert_eq!(queue.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn flush_processes_up_to_limit_sequentially() {
	let router = EventRouter::new();
	let queue = WorkQueue::new(router.clone(), "work", echo(), QueueConfig::new("flusher"))
		.unwrap();

	queue.start().unwrap();
	queue.pause().unwrap();
	for n in 0..3 {
		assert!(queue.add(json!(n)));
	}

	assert_eq!(queue.flush(Some(2)).await, 2);
	assert_eq!(queue.pending(), 1);
	assert_eq!(queue.flush(None).await, 1);
	assert_eq!(queue.pending(), 0);
	assert_eq!(queue.stats().success, 3);
}

#[tokio::test(start_paused = true)]
async fn purge_discards_pending_items() {
	let router = EventRouter::new();
	let queue = WorkQueue::new(router.clone(), "work", echo(), QueueConfig::new("purger"))
		.unwrap();

	queue.start().unwrap();
	queue.pause().unwrap();
	for n in 0..4 {
		assert!(queue.add(json!(n)));
	}

	assert_eq!(queue.purge(), 4);
	assert_eq!(queue.pending(), 0);
	assert_eq!(queue.stats().processed, 0);
}

#[tokio::test(start_paused = true)]
async fn stopped_queue_rejects_with_not_running() {
	let router = EventRouter::new();
	let queue = WorkQueue::new(router.clone(), "work", echo(), QueueConfig::new("idle"))
		.unwrap();

	let reasons = Arc::new(Mutex::new(Vec::new()));
	let reasons_clone = Arc::clone(&reasons);
	let _r = queue
		.on(QueuePhase::Rejected, move |event| {
			reasons_clone.lock().push(event.data["data"]["reason"].clone());
		})
		.unwrap();

	assert!(!queue.add(json!("early")));
	assert_eq!(*reasons.lock(), vec![json!("notRunning")]);
	assert_eq!(queue.stats().rejected, 1);
}

#[tokio::test(start_paused = true)]
async fn lifecycle_transition_errors_are_typed() {
	let router = EventRouter::new();
	let queue = WorkQueue::new(router.clone(), "work", echo(), QueueConfig::new("strict"))
		.unwrap();

	// Stopped -> paused is not in the transition table.
	let err = queue.pause().unwrap_err();
	assert!(err.is_invalid_transition());
	assert_eq!(queue.state(), QueueState::Stopped);

	queue.start().unwrap();
	queue.start().unwrap(); // no-op when already running
	assert_eq!(queue.state(), QueueState::Running);
}

#[tokio::test(start_paused = true)]
async fn queue_restarts_after_stop() {
	let router = EventRouter::new();
	let queue = WorkQueue::new(router.clone(), "work", echo(), QueueConfig::new("phoenix"))
		.unwrap();

	queue.start().unwrap();
	assert!(queue.add(json!(1)));
	wait_for(|| queue.stats().success == 1).await;

	queue.stop().unwrap();
	assert!(!queue.add(json!(2)));

	queue.start().unwrap();
	assert!(queue.add(json!(3)));
	wait_for(|| queue.stats().success == 2).await;
	assert_eq!(queue.state(), QueueState::Running);
}

#[tokio::test(start_paused = true)]
async fn pattern_bound_queue_never_admits_its_own_events() {
	let router = EventRouter::new();
	// A match-everything selector would feed the queue its own lifecycle
	// events if the envelope guard failed.
	let queue = WorkQueue::new(
		router.clone(),
		Regex::new(".*").unwrap(),
		echo(),
		QueueConfig::new("ouroboros"),
	)
	.unwrap();

	queue.start().unwrap();
	router.emit("anything", json!("payload")).unwrap();

	wait_for(|| queue.stats().success == 1).await;
	// Settle: lifecycle events from the success must not have re-admitted.
	tokio::time::sleep(Duration::from_millis(500)).await;
	assert_eq!(queue.stats().success, 1);
	assert_eq!(queue.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn external_emissions_are_admitted_at_default_priority() {
	let router = EventRouter::new();
	let queue = WorkQueue::new(router.clone(), "inbox", echo(), QueueConfig::new("listener"))
		.unwrap();

	queue.start().unwrap();
	// Not via `add`: a plain emission of the bound event.
	router.emit("inbox", json!({"from": "outside"})).unwrap();

	wait_for(|| queue.stats().success == 1).await;
	assert_eq!(queue.stats().processed, 1);
}

#[tokio::test(start_paused = true)]
async fn subscribers_unwrap_payloads_from_the_envelope() {
	let router = EventRouter::new();
	let queue = WorkQueue::new(router.clone(), "work", echo(), QueueConfig::new("boxed"))
		.unwrap();

	let envelopes = Arc::new(Mutex::new(Vec::new()));
	let envelopes_clone = Arc::clone(&envelopes);
	let _s = queue
		.on(QueuePhase::Success, move |event| {
			envelopes_clone.lock().push(event.data.clone());
		})
		.unwrap();

	queue.start().unwrap();
	assert!(queue.add(json!({"job": 1})));
	wait_for(|| queue.stats().success == 1).await;

	let envelopes = envelopes.lock();
	let envelope = relay_queue::QueueEvent::unwrap(&envelopes[0]).unwrap();
	assert_eq!(envelope.queue, "boxed");
	assert_eq!(envelope.phase, QueuePhase::Success);
	assert_eq!(envelope.data["item"]["data"], json!({"job": 1}));
	assert!(envelope.data["elapsedMs"].is_u64());
}

#[tokio::test(start_paused = true)]
async fn process_interval_spaces_out_tasks_on_one_worker() {
	let router = EventRouter::new();
	let queue = WorkQueue::new(
		router.clone(),
		"spaced",
		echo(),
		QueueConfig::new("deliberate").process_interval_ms(30),
	)
	.unwrap();

	let times = Arc::new(Mutex::new(Vec::new()));
	let times_clone = Arc::clone(&times);
	let _p = queue
		.on(QueuePhase::Processing, move |_event| {
			times_clone.lock().push(tokio::time::Instant::now());
		})
		.unwrap();

	queue.start().unwrap();
	queue.pause().unwrap();
	for n in 0..3 {
		assert!(queue.add(json!(n)));
	}
	queue.resume().unwrap();

	wait_for(|| queue.stats().success == 3).await;

	let times = times.lock();
	for pair in times.windows(2) {
		assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(30));
	}
}

#[tokio::test(start_paused = true)]
async fn snapshot_composes_state_pending_stats_and_limiter() {
	let router = EventRouter::new();
	let queue = WorkQueue::new(
		router.clone(),
		"work",
		echo(),
		QueueConfig::new("observed").rate_limit(5, 100),
	)
	.unwrap();

	queue.start().unwrap();
	queue.pause().unwrap();
	assert!(queue.add(json!(1)));

	let snapshot = queue.snapshot();
	assert_eq!(snapshot.name, "observed");
	assert_eq!(snapshot.state, QueueState::Paused);
	assert_eq!(snapshot.pending, 1);
	assert_eq!(snapshot.active, 0);
	let limiter = snapshot.rate_limiter.unwrap();
	assert_eq!(limiter.capacity, 5);
	assert_eq!(limiter.interval_ms, 100);

	// Snapshots serialise for external tooling.
	let as_json = serde_json::to_value(&snapshot).unwrap();
	assert_eq!(as_json["state"], json!("paused"));
}

#[tokio::test(start_paused = true)]
async fn auto_start_begins_accepting_at_construction() {
	let router = EventRouter::new();
	let queue = WorkQueue::new(
		router.clone(),
		"work",
		echo(),
		QueueConfig::new("eager").auto_start(true),
	)
	.unwrap();

	assert_eq!(queue.state(), QueueState::Running);
	assert!(queue.add(json!(1)));
	wait_for(|| queue.stats().success == 1).await;
}

#[tokio::test(start_paused = true)]
async fn idle_and_empty_phases_mark_buffer_transitions() {
	let router = EventRouter::new();
	let queue = WorkQueue::new(router.clone(), "work", echo(), QueueConfig::new("watcher"))
		.unwrap();

	let idles = Arc::new(Mutex::new(0usize));
	let idles_clone = Arc::clone(&idles);
	let _i = queue
		.on(QueuePhase::Idle, move |_event| {
			*idles_clone.lock() += 1;
		})
		.unwrap();

	let empties = Arc::new(Mutex::new(0usize));
	let empties_clone = Arc::clone(&empties);
	let _e = queue
		.on(QueuePhase::Empty, move |_event| {
			*empties_clone.lock() += 1;
		})
		.unwrap();

	queue.start().unwrap();
	wait_for(|| *idles.lock() >= 1).await;
	// Repeated empty polls do not repeat the idle event.
	tokio::time::sleep(Duration::from_millis(500)).await;
	assert_eq!(*idles.lock(), 1);

	assert!(queue.add(json!(1)));
	wait_for(|| *empties.lock() >= 1).await;
	assert_eq!(queue.stats().success, 1);
}

//! Token bucket rate limiter.
//!
//! Capacity `C` refills every interval `I`. Refill is computed lazily from
//! elapsed monotonic time at each acquire; there is no background timer.
//! Tokio's clock drives the waits, so paused-time tests advance the bucket
//! deterministically.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

struct BucketState {
	tokens: u32,
	last_refill: Instant,
}

impl BucketState {
	fn refill(&mut self, capacity: u32, interval: Duration) {
		let elapsed = Instant::now().duration_since(self.last_refill);
		if !interval.is_zero() && elapsed >= interval {
			let periods = (elapsed.as_millis() / interval.as_millis()) as u32;
			self.tokens = capacity;
			self.last_refill += interval * periods;
		}
	}

	fn next_refill_in(&self, interval: Duration) -> Duration {
		(self.last_refill + interval).saturating_duration_since(Instant::now())
	}
}

/// Point-in-time view of the bucket.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterSnapshot {
	pub tokens: u32,
	pub capacity: u32,
	pub interval_ms: u64,
}

/// Blocking token bucket.
pub struct RateLimiter {
	capacity: u32,
	interval: Duration,
	state: Mutex<BucketState>,
}

impl RateLimiter {
	/// Bucket starting full.
	pub fn new(capacity: u32, interval_ms: u64) -> Self {
		Self {
			capacity,
			interval: Duration::from_millis(interval_ms),
			state: Mutex::new(BucketState {
				tokens: capacity,
				last_refill: Instant::now(),
			}),
		}
	}

	/// Acquires one token, waiting for the next refill when empty.
	/// Returns true if the call had to wait.
	pub async fn acquire(&self) -> bool {
		self.acquire_with(|| {}).await
	}

	/// Like [`acquire`](Self::acquire), with a hook fired exactly once per
	/// call before the first wait.
	pub async fn acquire_with(&self, on_throttle: impl FnOnce()) -> bool {
		let mut on_throttle = Some(on_throttle);
		let mut throttled = false;
		loop {
			let wait = {
				let mut state = self.state.lock();
				state.refill(self.capacity, self.interval);
				if state.tokens > 0 {
					state.tokens -= 1;
					return throttled;
				}
				state.next_refill_in(self.interval)
			};
			if let Some(hook) = on_throttle.take() {
				hook();
			}
			throttled = true;
			tokio::time::sleep(wait).await;
		}
	}

	pub fn snapshot(&self) -> LimiterSnapshot {
		let mut state = self.state.lock();
		state.refill(self.capacity, self.interval);
		LimiterSnapshot {
			tokens: state.tokens,
			capacity: self.capacity,
			interval_ms: self.interval.as_millis() as u64,
		}
	}
}

impl std::fmt::Debug for RateLimiter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let snapshot = self.snapshot();
		f.debug_struct("RateLimiter")
			.field("tokens", &snapshot.tokens)
			.field("capacity", &snapshot.capacity)
			.field("interval_ms", &snapshot.interval_ms)
			.finish()
	}
}

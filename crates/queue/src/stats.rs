//! Queue statistics, derived solely from queue event notifications.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use relay::ChildObserver;

use crate::error::Result;
use crate::events::{QueuePhase, event_name};

/// Monotonic queue counters plus a running average of successful
/// processing time.
///
/// The average uses the update `avg' = (avg * (n - 1) + elapsed) / n` over
/// the success count; under concurrent successes it is an order-dependent
/// approximation of the true mean.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
	/// Tasks that finished, successfully or not.
	pub processed: u64,
	/// Tasks currently in flight.
	pub processing: u64,
	pub success: u64,
	pub error: u64,
	pub rejected: u64,
	pub avg_elapsed_ms: f64,
}

/// Keeps [`QueueStats`] current by listening to a queue's namespaced events.
pub(crate) struct StatsCollector {
	shared: Arc<Mutex<QueueStats>>,
}

impl StatsCollector {
	/// Registers the listener bundle through the queue's scoped observer.
	pub fn attach(observer: &ChildObserver, queue: &str) -> Result<Self> {
		let shared = Arc::new(Mutex::new(QueueStats::default()));

		for phase in [
			QueuePhase::Processing,
			QueuePhase::Success,
			QueuePhase::Error,
			QueuePhase::Rejected,
		] {
			let shared = Arc::clone(&shared);
			observer.on(event_name(queue, phase).as_str(), move |event| {
				let mut stats = shared.lock();
				match phase {
					QueuePhase::Processing => stats.processing += 1,
					QueuePhase::Success => {
						stats.processing = stats.processing.saturating_sub(1);
						stats.processed += 1;
						stats.success += 1;
						let elapsed = elapsed_ms(&event.data).unwrap_or(0.0);
						let n = stats.success as f64;
						stats.avg_elapsed_ms = (stats.avg_elapsed_ms * (n - 1.0) + elapsed) / n;
					}
					QueuePhase::Error => {
						stats.processing = stats.processing.saturating_sub(1);
						stats.processed += 1;
						stats.error += 1;
					}
					QueuePhase::Rejected => stats.rejected += 1,
					_ => {}
				}
			})?;
		}

		Ok(Self { shared })
	}

	/// Cloned snapshot; external mutation cannot reach the live counters.
	pub fn snapshot(&self) -> QueueStats {
		self.shared.lock().clone()
	}
}

/// Pulls `data.elapsedMs` out of an envelope value.
fn elapsed_ms(envelope: &Value) -> Option<f64> {
	envelope.get("data")?.get("elapsedMs")?.as_f64()
}

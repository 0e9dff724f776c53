//! Pull iteration over a live subscription.
//!
//! [`EventIter`] turns the push delivery of a subscription into a lazy pull
//! sequence. Values that arrive while no consumer is waiting are buffered;
//! concurrent `next` calls all resolve with the same next value. Cancellation
//! releases the underlying subscription, resolves every outstanding `next`
//! with the last observed value, and makes further calls fail with
//! [`Error::DestroyedIterator`].

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use futures_util::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::registry::Event;
use crate::router::{EventRouter, SpyAction, SpyKind, Subscription};
use crate::selector::Selector;

#[derive(Default)]
struct IterState {
	done: bool,
	last: Option<Event>,
	backlog: VecDeque<Event>,
	waiters: Vec<oneshot::Sender<Option<Event>>>,
	subscription: Option<Subscription>,
}

struct IterShared {
	router: EventRouter,
	selector: Selector,
	state: Mutex<IterState>,
}

impl IterShared {
	fn deliver(&self, event: Event) {
		let mut state = self.state.lock();
		if state.done {
			return;
		}
		state.last = Some(event.clone());
		if state.waiters.is_empty() {
			state.backlog.push_back(event);
		} else {
			for waiter in state.waiters.drain(..) {
				let _ = waiter.send(Some(event.clone()));
			}
		}
	}

	fn cancel(&self) {
		let (subscription, waiters, last) = {
			let mut state = self.state.lock();
			if state.done {
				return;
			}
			state.done = true;
			state.backlog.clear();
			(
				state.subscription.take(),
				std::mem::take(&mut state.waiters),
				state.last.clone(),
			)
		};
		// Outside the iterator lock: unsubscribing takes the registry lock.
		drop(subscription);
		for waiter in waiters {
			let _ = waiter.send(last.clone());
		}
		self.router.spy_action(SpyAction {
			kind: SpyKind::Cleanup,
			event: self.selector.key().to_string(),
			data: None,
			listener: None,
		});
	}
}

/// A live subscription consumable as a lazy, potentially infinite sequence.
///
/// Created by [`EventRouter::iter`]. Clones share the same sequence.
#[derive(Clone)]
pub struct EventIter {
	shared: Arc<IterShared>,
}

impl EventIter {
	pub(crate) fn new(router: EventRouter, selector: Selector) -> Result<Self> {
		selector.validate()?;
		let shared = Arc::new(IterShared {
			router: router.clone(),
			selector: selector.clone(),
			state: Mutex::new(IterState::default()),
		});
		let weak: Weak<IterShared> = Arc::downgrade(&shared);
		let subscription = router.on_arc(
			selector,
			Arc::new(move |event: Event| {
				if let Some(shared) = weak.upgrade() {
					shared.deliver(event);
				}
			}),
		)?;
		shared.state.lock().subscription = Some(subscription);
		Ok(Self { shared })
	}

	/// Resolves with the next matching event.
	///
	/// Returns `Ok(None)` only when the iterator is cancelled before any
	/// value was ever observed; after cancellation with a prior value,
	/// outstanding calls resolve with that value.
	///
	/// # Errors
	///
	/// Returns [`Error::DestroyedIterator`] once the iterator has been
	/// cancelled.
	pub async fn next(&self) -> Result<Option<Event>> {
		let rx = {
			let mut state = self.shared.state.lock();
			if state.done {
				return Err(Error::DestroyedIterator);
			}
			if let Some(event) = state.backlog.pop_front() {
				return Ok(Some(event));
			}
			let (tx, rx) = oneshot::channel();
			state.waiters.push(tx);
			rx
		};
		rx.await.map_err(|_| Error::DestroyedIterator)
	}

	/// Emits a payload through the owning router on this iterator's selector.
	///
	/// # Errors
	///
	/// Returns [`Error::DestroyedIterator`] after cancellation, or any
	/// emission error from the router.
	pub fn emit(&self, data: Value) -> Result<()> {
		if self.shared.state.lock().done {
			return Err(Error::DestroyedIterator);
		}
		self.shared.router.emit(&self.shared.selector, data)
	}

	/// Cancels the iterator. Idempotent.
	///
	/// Releases the underlying subscription and resolves all outstanding
	/// [`next`](Self::next) calls with the last observed value.
	pub fn cancel(&self) {
		self.shared.cancel();
	}

	/// Returns true once the iterator has been cancelled.
	pub fn is_done(&self) -> bool {
		self.shared.state.lock().done
	}

	/// The last value observed, if any.
	pub fn last(&self) -> Option<Event> {
		self.shared.state.lock().last.clone()
	}

	/// Cancels the iterator when the signal trips.
	///
	/// Trip processing is deferred by one scheduling tick so emissions
	/// already dispatched on other tasks land first. A dropped sender never
	/// trips the signal.
	pub fn bind_cancel(&self, signal: oneshot::Receiver<()>) {
		let shared = Arc::clone(&self.shared);
		tokio::spawn(async move {
			if signal.await.is_ok() {
				tokio::task::yield_now().await;
				shared.cancel();
			}
		});
	}

	/// Adapts the iterator into a [`Stream`] that ends at cancellation.
	pub fn into_stream(self) -> impl Stream<Item = Event> {
		futures_util::stream::unfold(self, |iter| async move {
			match iter.next().await {
				Ok(Some(event)) => Some((event, iter)),
				Ok(None) | Err(_) => None,
			}
		})
	}
}

impl std::fmt::Debug for EventIter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.shared.state.lock();
		f.debug_struct("EventIter")
			.field("selector", &self.shared.selector.key())
			.field("done", &state.done)
			.field("buffered", &state.backlog.len())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[tokio::test]
	async fn test_buffered_values_pull_in_order() {
		let router = EventRouter::new();
		let iter = router.iter("m").unwrap();

		router.emit("m", json!(1)).unwrap();
		router.emit("m", json!(2)).unwrap();

		assert_eq!(iter.next().await.unwrap().unwrap().data, json!(1));
		assert_eq!(iter.next().await.unwrap().unwrap().data, json!(2));
	}

	#[tokio::test]
	async fn test_pending_next_resolves_on_emission() {
		let router = EventRouter::new();
		let iter = router.iter("m").unwrap();

		let pending = tokio::spawn({
			let iter = iter.clone();
			async move { iter.next().await }
		});
		tokio::task::yield_now().await;

		router.emit("m", json!("late")).unwrap();
		let event = pending.await.unwrap().unwrap().unwrap();
		assert_eq!(event.data, json!("late"));
	}

	#[tokio::test]
	async fn test_cancel_resolves_outstanding_with_last_value() {
		let router = EventRouter::new();
		let iter = router.iter("m").unwrap();

		router.emit("m", json!(7)).unwrap();
		assert_eq!(iter.next().await.unwrap().unwrap().data, json!(7));

		let pending = tokio::spawn({
			let iter = iter.clone();
			async move { iter.next().await }
		});
		tokio::task::yield_now().await;

		iter.cancel();
		let resolved = pending.await.unwrap().unwrap().unwrap();
		assert_eq!(resolved.data, json!(7));

		assert!(iter.next().await.unwrap_err().is_destroyed());
		assert!(iter.emit(json!(8)).unwrap_err().is_destroyed());
	}

	#[tokio::test]
	async fn test_cancel_without_values_resolves_none() {
		let router = EventRouter::new();
		let iter = router.iter("m").unwrap();

		let pending = tokio::spawn({
			let iter = iter.clone();
			async move { iter.next().await }
		});
		tokio::task::yield_now().await;

		iter.cancel();
		assert!(pending.await.unwrap().unwrap().is_none());
	}

	#[tokio::test]
	async fn test_cancel_is_idempotent_and_releases_subscription() {
		let router = EventRouter::new();
		let iter = router.iter("m").unwrap();
		assert!(router.has("m"));

		iter.cancel();
		iter.cancel();
		assert!(!router.has("m"));
	}

	#[tokio::test]
	async fn test_bind_cancel_trips_once() {
		let router = EventRouter::new();
		let iter = router.iter("m").unwrap();
		let (tx, rx) = oneshot::channel();
		iter.bind_cancel(rx);

		tx.send(()).unwrap();
		// One tick of deferral, then the cancellation lands.
		for _ in 0..10 {
			if iter.is_done() {
				break;
			}
			tokio::task::yield_now().await;
		}
		assert!(iter.is_done());
	}

	#[tokio::test]
	async fn test_emit_round_trips_through_router() {
		let router = EventRouter::new();
		let iter = router.iter("loop").unwrap();

		iter.emit(json!({"x": 1})).unwrap();
		let event = iter.next().await.unwrap().unwrap();
		assert_eq!(event.data, json!({"x": 1}));
		assert_eq!(event.name.as_ref(), "loop");
	}
}

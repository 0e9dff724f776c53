//! Scoped subscription bundles.
//!
//! A [`ChildObserver`] owns every subscription made through it, keyed by
//! selector, so a single [`cleanup`](ChildObserver::cleanup) (or drop)
//! detaches them all. The parent router's side channel drives symmetric
//! pruning: when a tracked listener is removed externally, the observer's
//! index entry goes with it.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::Result;
use crate::registry::{Event, ListenerId, Notice};
use crate::router::{EventRouter, SpyAction, SpyKind, Subscription};
use crate::selector::Selector;

struct OwnedListener {
	id: ListenerId,
	handle: Subscription,
}

type OwnedIndex = Arc<Mutex<IndexMap<String, Vec<OwnedListener>>>>;

/// A scoped bundle of subscriptions against a parent router.
pub struct ChildObserver {
	router: EventRouter,
	index: OwnedIndex,
	notice_id: Option<u64>,
}

impl ChildObserver {
	pub(crate) fn new(router: EventRouter) -> Self {
		let index: OwnedIndex = Arc::new(Mutex::new(IndexMap::new()));
		let weak = Arc::downgrade(&index);
		// Runs under the registry lock: touch only the local index, and
		// disarm handles instead of dropping them (their droppers would
		// re-take the registry lock).
		let notice_id = router.register_notice(Arc::new(move |notice: &Notice| {
			let Some(index) = weak.upgrade() else {
				return;
			};
			match notice {
				Notice::Off { event, listener } => {
					let mut index = index.lock();
					if let Some(owned) = index.get_mut(event.as_str()) {
						if let Some(position) = owned.iter().position(|e| e.id == *listener) {
							owned.remove(position).handle.forget();
						}
						if owned.is_empty() {
							index.shift_remove(event.as_str());
						}
					}
				}
				Notice::Clear => {
					let drained: Vec<_> = index.lock().drain(..).collect();
					for (_, owned) in drained {
						for entry in owned {
							entry.handle.forget();
						}
					}
				}
				Notice::On { .. } | Notice::Emit { .. } => {}
			}
		}));
		Self {
			router,
			index,
			notice_id: Some(notice_id),
		}
	}

	/// Subscribes through the parent router and tracks the listener locally.
	pub fn on<F>(&self, selector: impl Into<Selector>, callback: F) -> Result<ListenerId>
	where
		F: Fn(Event) + Send + Sync + 'static,
	{
		let selector = selector.into();
		let subscription = self.router.on(&selector, callback)?;
		Ok(self.track(&selector, subscription))
	}

	/// One-shot variant of [`on`](Self::on).
	pub fn once<F>(&self, selector: impl Into<Selector>, callback: F) -> Result<ListenerId>
	where
		F: Fn(Event) + Send + Sync + 'static,
	{
		let selector = selector.into();
		let subscription = self.router.once(&selector, callback)?;
		Ok(self.track(&selector, subscription))
	}

	fn track(&self, selector: &Selector, subscription: Subscription) -> ListenerId {
		let id = subscription.id();
		self.index
			.lock()
			.entry(selector.key().to_string())
			.or_default()
			.push(OwnedListener {
				id,
				handle: subscription,
			});
		id
	}

	/// Unsubscribes tracked listeners.
	///
	/// Wildcard empties the whole local index; otherwise only the given
	/// selector's listeners are released.
	pub fn off(&self, selector: impl Into<Selector>) -> Result<()> {
		let selector = selector.into();
		selector.validate()?;
		// Move handles out before dropping them: their droppers take the
		// registry lock, whose notices take the index lock.
		let handles: Vec<OwnedListener> = {
			let mut index = self.index.lock();
			if selector.is_wildcard() {
				index.drain(..).flat_map(|(_, owned)| owned).collect()
			} else {
				index.shift_remove(selector.key()).unwrap_or_default()
			}
		};
		for entry in handles {
			entry.handle.unsubscribe();
		}
		Ok(())
	}

	/// Emits through the parent router.
	pub fn emit(&self, selector: impl Into<Selector>, data: Value) -> Result<()> {
		self.router.emit(selector, data)
	}

	/// Number of listeners currently tracked.
	pub fn tracked(&self) -> usize {
		self.index.lock().values().map(Vec::len).sum()
	}

	/// Releases every tracked subscription and the side-channel registration.
	pub fn cleanup(&mut self) {
		if let Some(notice_id) = self.notice_id.take() {
			self.router.unregister_notice(notice_id);
		}
		let handles: Vec<OwnedListener> = self.index.lock().drain(..).flat_map(|(_, v)| v).collect();
		let had_any = !handles.is_empty();
		for entry in handles {
			entry.handle.unsubscribe();
		}
		if had_any {
			self.router.spy_action(SpyAction {
				kind: SpyKind::Cleanup,
				event: "*".to_string(),
				data: None,
				listener: None,
			});
		}
	}
}

impl Drop for ChildObserver {
	fn drop(&mut self) {
		self.cleanup();
	}
}

impl std::fmt::Debug for ChildObserver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChildObserver")
			.field("tracked", &self.tracked())
			.field("active", &self.notice_id.is_some())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[test]
	fn test_cleanup_detaches_every_tracked_listener() {
		let router = EventRouter::new();
		let mut observer = router.observer();

		observer.on("a", |_event| {}).unwrap();
		observer.on("b", |_event| {}).unwrap();
		observer.once("c", |_event| {}).unwrap();
		assert_eq!(observer.tracked(), 3);

		observer.cleanup();
		assert_eq!(observer.tracked(), 0);
		assert!(!router.has("a"));
		assert!(!router.has("b"));
		assert!(!router.has("c"));
	}

	#[test]
	fn test_external_removal_prunes_the_index() {
		let router = EventRouter::new();
		let observer = router.observer();

		observer.on("a", |_event| {}).unwrap();
		assert_eq!(observer.tracked(), 1);

		router.off("a").unwrap();
		assert_eq!(observer.tracked(), 0);
	}

	#[test]
	fn test_clear_notice_empties_the_index() {
		let router = EventRouter::new();
		let observer = router.observer();

		observer.on("a", |_event| {}).unwrap();
		observer.on("b", |_event| {}).unwrap();

		router.off("*").unwrap();
		assert_eq!(observer.tracked(), 0);
	}

	#[test]
	fn test_wildcard_off_releases_only_owned_listeners() {
		let router = EventRouter::new();
		let _outside = router.on("a", |_event| {}).unwrap();

		let observer = router.observer();
		observer.on("a", |_event| {}).unwrap();
		observer.off("*").unwrap();

		// The unrelated listener survives the scoped wildcard.
		assert!(router.has("a"));
		assert_eq!(observer.tracked(), 0);
	}

	#[test]
	fn test_once_through_observer_untracks_after_firing() {
		let router = EventRouter::new();
		let observer = router.observer();
		let hits = Arc::new(AtomicUsize::new(0));
		let hits_clone = Arc::clone(&hits);

		observer
			.once("ping", move |_event| {
				hits_clone.fetch_add(1, Ordering::SeqCst);
			})
			.unwrap();

		router.emit("ping", json!(null)).unwrap();
		router.emit("ping", json!(null)).unwrap();

		assert_eq!(hits.load(Ordering::SeqCst), 1);
		assert_eq!(observer.tracked(), 0);
	}

	#[test]
	fn test_drop_cleans_up() {
		let router = EventRouter::new();
		{
			let observer = router.observer();
			observer.on("scoped", |_event| {}).unwrap();
			assert!(router.has("scoped"));
		}
		assert!(!router.has("scoped"));
	}
}

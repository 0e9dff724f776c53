//! Listener registry: dual literal/pattern maps plus the internal side channel.
//!
//! Listeners are stored in insertion order with stable [`ListenerId`] tokens.
//! Callback identity (the `Arc` data pointer) additionally dedupes repeated
//! registration of the same callback under the same selector. Side-channel
//! notices (`on`/`off`/`emit`/`clear`) are dispatched synchronously while the
//! registry lock is held, so scoped observers can prune their indices without
//! racing external unsubscription.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;

/// Unique identifier for registered listeners.
pub type ListenerId = u64;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Returns a new globally-unique listener ID.
pub fn next_listener_id() -> ListenerId {
	NEXT_LISTENER_ID.fetch_add(1, Ordering::SeqCst)
}

/// An event delivered to a listener.
#[derive(Clone, Debug)]
pub struct Event {
	/// The literal event name this delivery resolved to.
	pub name: Arc<str>,
	/// The payload passed to `emit`.
	pub data: Value,
	/// True when the listener matched via a pattern rather than the exact name.
	pub via_pattern: bool,
}

/// Listener callback: invoked synchronously during emission.
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// Stable identity key for a callback (its `Arc` data pointer).
pub(crate) fn callback_key(callback: &EventCallback) -> usize {
	Arc::as_ptr(callback) as *const () as usize
}

/// Internal lifecycle notice dispatched on the side channel.
#[derive(Clone, Debug)]
pub(crate) enum Notice {
	/// A listener was registered under `event`.
	On { event: String, listener: ListenerId },
	/// A listener was removed from `event`.
	Off { event: String, listener: ListenerId },
	/// An emission resolved to the literal name `event`.
	Emit { event: String },
	/// Both maps were emptied.
	Clear,
}

pub(crate) type NoticeFn = Arc<dyn Fn(&Notice) + Send + Sync>;

pub(crate) struct ListenerEntry {
	pub id: ListenerId,
	pub key: usize,
	pub callback: EventCallback,
	pub once: bool,
}

pub(crate) struct PatternBucket {
	pub regex: Regex,
	pub entries: Vec<ListenerEntry>,
}

/// Registry state guarded by the router's single lock.
#[derive(Default)]
pub(crate) struct Registry {
	/// Literal event name -> listeners, in insertion order.
	pub literal: IndexMap<String, Vec<ListenerEntry>>,
	/// Canonical pattern source -> compiled pattern + listeners.
	pub patterns: IndexMap<String, PatternBucket>,
	/// Side-channel subscribers, invoked under the registry lock.
	notices: Vec<(u64, NoticeFn)>,
}

/// Outcome of inserting a listener: a fresh registration or an identity dedup.
pub(crate) enum Inserted {
	New(ListenerId),
	Existing(ListenerId),
}

impl Registry {
	/// Inserts a listener under a literal name. Re-adding the same callback
	/// `Arc` is a no-op that yields the existing listener's ID.
	pub fn insert_literal(&mut self, name: &str, entry: ListenerEntry) -> Inserted {
		let entries = self.literal.entry(name.to_string()).or_default();
		if let Some(existing) = entries.iter().find(|e| e.key == entry.key) {
			return Inserted::Existing(existing.id);
		}
		let id = entry.id;
		entries.push(entry);
		Inserted::New(id)
	}

	/// Inserts a listener under a pattern, creating the bucket on first use.
	pub fn insert_pattern(&mut self, regex: &Regex, entry: ListenerEntry) -> Inserted {
		let bucket = self
			.patterns
			.entry(regex.as_str().to_string())
			.or_insert_with(|| PatternBucket {
				regex: regex.clone(),
				entries: Vec::new(),
			});
		if let Some(existing) = bucket.entries.iter().find(|e| e.key == entry.key) {
			return Inserted::Existing(existing.id);
		}
		let id = entry.id;
		bucket.entries.push(entry);
		Inserted::New(id)
	}

	/// Removes the listener with `id` from the map selected by `pattern`.
	/// Returns true if an entry was actually removed.
	pub fn remove_id(&mut self, key: &str, pattern: bool, id: ListenerId) -> bool {
		let removed = if pattern {
			match self.patterns.get_mut(key) {
				Some(bucket) => {
					let before = bucket.entries.len();
					bucket.entries.retain(|e| e.id != id);
					let removed = bucket.entries.len() != before;
					if bucket.entries.is_empty() {
						self.patterns.shift_remove(key);
					}
					removed
				}
				None => false,
			}
		} else {
			match self.literal.get_mut(key) {
				Some(entries) => {
					let before = entries.len();
					entries.retain(|e| e.id != id);
					let removed = entries.len() != before;
					if entries.is_empty() {
						self.literal.shift_remove(key);
					}
					removed
				}
				None => false,
			}
		};
		if removed {
			self.dispatch(&Notice::Off {
				event: key.to_string(),
				listener: id,
			});
		}
		removed
	}

	/// Removes every listener under a literal key. Returns the removed IDs.
	pub fn remove_literal_key(&mut self, name: &str) -> Vec<ListenerId> {
		let ids: Vec<ListenerId> = self
			.literal
			.shift_remove(name)
			.map(|entries| entries.iter().map(|e| e.id).collect())
			.unwrap_or_default();
		for id in &ids {
			self.dispatch(&Notice::Off {
				event: name.to_string(),
				listener: *id,
			});
		}
		ids
	}

	/// Removes every listener under a pattern key. Returns the removed IDs.
	pub fn remove_pattern_key(&mut self, key: &str) -> Vec<ListenerId> {
		let ids: Vec<ListenerId> = self
			.patterns
			.shift_remove(key)
			.map(|bucket| bucket.entries.iter().map(|e| e.id).collect())
			.unwrap_or_default();
		for id in &ids {
			self.dispatch(&Notice::Off {
				event: key.to_string(),
				listener: *id,
			});
		}
		ids
	}

	/// Removes a specific callback (by identity) from a literal key.
	pub fn remove_literal_callback(&mut self, name: &str, cb_key: usize) -> Vec<ListenerId> {
		let mut ids = Vec::new();
		if let Some(entries) = self.literal.get_mut(name) {
			entries.retain(|e| {
				if e.key == cb_key {
					ids.push(e.id);
					false
				} else {
					true
				}
			});
			if entries.is_empty() {
				self.literal.shift_remove(name);
			}
		}
		for id in &ids {
			self.dispatch(&Notice::Off {
				event: name.to_string(),
				listener: *id,
			});
		}
		ids
	}

	/// Removes a specific callback (by identity) from a pattern bucket.
	pub fn remove_pattern_callback(&mut self, key: &str, cb_key: usize) -> Vec<ListenerId> {
		let mut ids = Vec::new();
		if let Some(bucket) = self.patterns.get_mut(key) {
			bucket.entries.retain(|e| {
				if e.key == cb_key {
					ids.push(e.id);
					false
				} else {
					true
				}
			});
			if bucket.entries.is_empty() {
				self.patterns.shift_remove(key);
			}
		}
		for id in &ids {
			self.dispatch(&Notice::Off {
				event: key.to_string(),
				listener: *id,
			});
		}
		ids
	}

	/// Literal names currently registered that the pattern matches.
	pub fn matching_literal_names(&self, regex: &Regex) -> Vec<String> {
		self.literal
			.keys()
			.filter(|name| regex.is_match(name))
			.cloned()
			.collect()
	}

	/// Empties both maps and dispatches a `clear` notice.
	pub fn clear(&mut self) -> usize {
		let count = self.literal.values().map(Vec::len).sum::<usize>()
			+ self.patterns.values().map(|b| b.entries.len()).sum::<usize>();
		self.literal.clear();
		self.patterns.clear();
		self.dispatch(&Notice::Clear);
		count
	}

	/// Snapshot of the literal listeners for `name`, in registration order.
	/// One-shot entries are removed from the registry before the snapshot is
	/// returned, so they fire at most once even under concurrent emission.
	pub fn snapshot_literal(&mut self, name: &str) -> Vec<EventCallback> {
		let mut callbacks = Vec::new();
		let mut removed = Vec::new();
		if let Some(entries) = self.literal.get_mut(name) {
			for entry in entries.iter() {
				callbacks.push(Arc::clone(&entry.callback));
			}
			entries.retain(|e| {
				if e.once {
					removed.push(e.id);
					false
				} else {
					true
				}
			});
			if entries.is_empty() {
				self.literal.shift_remove(name);
			}
		}
		for id in removed {
			self.dispatch(&Notice::Off {
				event: name.to_string(),
				listener: id,
			});
		}
		callbacks
	}

	/// Snapshot of the pattern listeners whose pattern matches `name`, in
	/// pattern registration order. One-shot entries are removed as above.
	pub fn snapshot_patterns(&mut self, name: &str) -> Vec<EventCallback> {
		let mut callbacks = Vec::new();
		let mut removed: Vec<(String, ListenerId)> = Vec::new();
		let mut empty_keys = Vec::new();
		for (key, bucket) in self.patterns.iter_mut() {
			if !bucket.regex.is_match(name) {
				continue;
			}
			for entry in bucket.entries.iter() {
				callbacks.push(Arc::clone(&entry.callback));
			}
			bucket.entries.retain(|e| {
				if e.once {
					removed.push((key.clone(), e.id));
					false
				} else {
					true
				}
			});
			if bucket.entries.is_empty() {
				empty_keys.push(key.clone());
			}
		}
		for key in empty_keys {
			self.patterns.shift_remove(&key);
		}
		for (key, id) in removed {
			self.dispatch(&Notice::Off {
				event: key,
				listener: id,
			});
		}
		callbacks
	}

	/// Registers a side-channel subscriber. Returns its registration ID.
	pub fn register_notice(&mut self, callback: NoticeFn) -> u64 {
		let id = next_listener_id();
		self.notices.push((id, callback));
		id
	}

	/// Removes a side-channel subscriber.
	pub fn unregister_notice(&mut self, id: u64) {
		self.notices.retain(|(notice_id, _)| *notice_id != id);
	}

	/// Number of side-channel subscribers.
	pub fn notice_count(&self) -> usize {
		self.notices.len()
	}

	/// Dispatches a notice to every side-channel subscriber.
	///
	/// Runs under the registry lock; subscribers must not call back into the
	/// router.
	pub fn dispatch(&self, notice: &Notice) {
		for (_, callback) in &self.notices {
			callback(notice);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn noop() -> EventCallback {
		Arc::new(|_event: Event| {})
	}

	fn entry(callback: &EventCallback, once: bool) -> ListenerEntry {
		ListenerEntry {
			id: next_listener_id(),
			key: callback_key(callback),
			callback: Arc::clone(callback),
			once,
		}
	}

	#[test]
	fn test_listener_id_increments() {
		let id1 = next_listener_id();
		let id2 = next_listener_id();
		assert!(id2 > id1);
	}

	#[test]
	fn test_insert_same_callback_is_idempotent() {
		let mut registry = Registry::default();
		let callback = noop();

		let first = match registry.insert_literal("tick", entry(&callback, false)) {
			Inserted::New(id) => id,
			Inserted::Existing(_) => panic!("first insert must be new"),
		};
		match registry.insert_literal("tick", entry(&callback, false)) {
			Inserted::Existing(id) => assert_eq!(id, first),
			Inserted::New(_) => panic!("re-add of the same callback must dedupe"),
		}
		assert_eq!(registry.literal.get("tick").unwrap().len(), 1);
	}

	#[test]
	fn test_removing_last_listener_removes_the_key() {
		let mut registry = Registry::default();
		let callback = noop();
		let id = match registry.insert_literal("tick", entry(&callback, false)) {
			Inserted::New(id) => id,
			Inserted::Existing(id) => id,
		};

		assert!(registry.remove_id("tick", false, id));
		assert!(registry.literal.is_empty());
		assert!(!registry.remove_id("tick", false, id));
	}

	#[test]
	fn test_once_entries_removed_by_snapshot() {
		let mut registry = Registry::default();
		let callback = noop();
		registry.insert_literal("tick", entry(&callback, true));

		let first = registry.snapshot_literal("tick");
		assert_eq!(first.len(), 1);
		let second = registry.snapshot_literal("tick");
		assert!(second.is_empty());
		assert!(registry.literal.is_empty());
	}

	#[test]
	fn test_pattern_snapshot_matches_by_name() {
		let mut registry = Registry::default();
		let callback = noop();
		let regex = Regex::new("^foo.*$").unwrap();
		registry.insert_pattern(&regex, entry(&callback, false));

		assert_eq!(registry.snapshot_patterns("foobar").len(), 1);
		assert!(registry.snapshot_patterns("barfoo").is_empty());
	}

	#[test]
	fn test_clear_reports_total_and_notifies() {
		let mut registry = Registry::default();
		let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
		let seen_clone = Arc::clone(&seen);
		registry.register_notice(Arc::new(move |notice| {
			seen_clone.lock().push(format!("{notice:?}"));
		}));

		let a = noop();
		let b = noop();
		registry.insert_literal("a", entry(&a, false));
		registry.insert_pattern(&Regex::new("b.*").unwrap(), entry(&b, false));

		assert_eq!(registry.clear(), 2);
		assert!(registry.literal.is_empty());
		assert!(registry.patterns.is_empty());
		assert!(seen.lock().iter().any(|n| n.contains("Clear")));
	}
}

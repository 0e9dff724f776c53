//! The event router: subscription registry, emission fan-out, and
//! instrumentation.
//!
//! A [`EventRouter`] is a cheap clonable handle over shared state. Subscribe,
//! emit, and unsubscribe are synchronous: emission snapshots the matching
//! listeners under the registry lock, releases it, then invokes the snapshot
//! in registration order (literal listeners first, then pattern listeners).
//! Side-channel notices for scoped observers are dispatched while the lock is
//! held so observer indices cannot race external unsubscription.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::iterator::EventIter;
use crate::observer::ChildObserver;
use crate::registry::{
	Event, EventCallback, Inserted, ListenerEntry, ListenerId, Notice, NoticeFn, Registry,
	callback_key, next_listener_id,
};
use crate::selector::Selector;

/// What a spy action was recorded for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpyKind {
	/// A persistent subscription was added.
	On,
	/// A one-shot subscription was added.
	Once,
	/// A subscription (or a whole selector) was removed.
	Off,
	/// An emission was dispatched.
	Emit,
	/// A scoped bundle (observer or iterator) was cleaned up.
	Cleanup,
}

/// Action descriptor passed to an installed spy.
#[derive(Clone, Debug)]
pub struct SpyAction {
	pub kind: SpyKind,
	/// Canonical selector key the action applies to.
	pub event: String,
	/// Emission payload, for [`SpyKind::Emit`] actions.
	pub data: Option<Value>,
	/// Listener the action applies to, when it concerns a single one.
	pub listener: Option<ListenerId>,
}

/// Spy callback, invoked on every subscribe, unsubscribe, emit, and cleanup.
pub type SpyFn = Arc<dyn Fn(&SpyAction) + Send + Sync>;

/// Emission validation hook. An `Err` aborts the emission.
pub type ValidatorFn = Arc<dyn Fn(&Selector, &Value) -> Result<()> + Send + Sync>;

/// Listener counts per selector key.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerCount {
	pub event: String,
	pub count: usize,
}

/// Shallow diagnostics: listener counts and spy presence.
#[derive(Debug, Clone, Serialize)]
pub struct RouterFacts {
	pub listeners: Vec<ListenerCount>,
	pub pattern_listeners: Vec<ListenerCount>,
	pub has_spy: bool,
}

/// Listener IDs per selector key.
#[derive(Debug, Clone, Serialize)]
pub struct InternalEntry {
	pub event: String,
	pub listeners: Vec<ListenerId>,
}

/// Deep diagnostics snapshot. For debugging only; shapes are not stable.
#[derive(Debug, Clone, Serialize)]
pub struct RouterInternals {
	pub listeners: Vec<InternalEntry>,
	pub pattern_listeners: Vec<InternalEntry>,
	pub notice_subscribers: usize,
	pub has_spy: bool,
	pub debug: bool,
}

struct SpyState {
	current: Option<SpyFn>,
	pre_debug: Option<Option<SpyFn>>,
	debug: bool,
}

pub(crate) struct RouterInner {
	registry: Mutex<Registry>,
	spy: Mutex<SpyState>,
	validator: Mutex<Option<ValidatorFn>>,
}

/// Invokes the installed spy, if any. A panicking spy is isolated and
/// reported through `tracing`; it never propagates into router callers.
pub(crate) fn notify_spy(inner: &RouterInner, action: SpyAction) {
	let spy = inner.spy.lock().current.clone();
	if let Some(spy) = spy {
		if catch_unwind(AssertUnwindSafe(|| spy(&action))).is_err() {
			tracing::error!(kind = ?action.kind, event = %action.event, "event spy panicked");
		}
	}
}

/// In-process event router.
///
/// Cloning shares the underlying registry. See the module docs for the
/// delivery and locking model.
#[derive(Clone)]
pub struct EventRouter {
	inner: Arc<RouterInner>,
}

impl EventRouter {
	/// Creates an empty router.
	pub fn new() -> Self {
		Self {
			inner: Arc::new(RouterInner {
				registry: Mutex::new(Registry::default()),
				spy: Mutex::new(SpyState {
					current: None,
					pre_debug: None,
					debug: false,
				}),
				validator: Mutex::new(None),
			}),
		}
	}

	/// Installs an emission validation hook. The hook runs before every
	/// `emit`; an `Err` return aborts the emission and surfaces to the caller.
	pub fn set_validator<F>(&self, validator: F)
	where
		F: Fn(&Selector, &Value) -> Result<()> + Send + Sync + 'static,
	{
		*self.inner.validator.lock() = Some(Arc::new(validator));
	}

	/// Removes the emission validation hook.
	pub fn clear_validator(&self) {
		*self.inner.validator.lock() = None;
	}

	/// Subscribes a callback to a selector.
	///
	/// Returns a [`Subscription`] handle; dropping it (or calling
	/// [`Subscription::unsubscribe`]) removes exactly this listener and fires
	/// the `off` side notice.
	///
	/// # Errors
	///
	/// Returns [`Error::InvalidEvent`] for an empty literal name.
	pub fn on<F>(&self, selector: impl Into<Selector>, callback: F) -> Result<Subscription>
	where
		F: Fn(Event) + Send + Sync + 'static,
	{
		self.register(selector.into(), Arc::new(callback), false)
	}

	/// Subscribes a shared callback, deduplicated by `Arc` identity:
	/// re-adding the same callback under the same selector is a no-op that
	/// returns a handle to the existing registration.
	pub fn on_arc(
		&self,
		selector: impl Into<Selector>,
		callback: EventCallback,
	) -> Result<Subscription> {
		self.register(selector.into(), callback, false)
	}

	/// Subscribes a callback that is removed before its first (and only)
	/// invocation.
	pub fn once<F>(&self, selector: impl Into<Selector>, callback: F) -> Result<Subscription>
	where
		F: Fn(Event) + Send + Sync + 'static,
	{
		self.register(selector.into(), Arc::new(callback), true)
	}

	/// Resolves with the next event matching the selector.
	///
	/// Dropping the returned future detaches the hidden subscription.
	pub fn next_event(&self, selector: impl Into<Selector>) -> Result<NextEvent> {
		let (tx, rx) = oneshot::channel();
		let slot = Mutex::new(Some(tx));
		let subscription = self.register(
			selector.into(),
			Arc::new(move |event: Event| {
				if let Some(tx) = slot.lock().take() {
					let _ = tx.send(event);
				}
			}),
			true,
		)?;
		Ok(NextEvent {
			rx,
			subscription: Some(subscription),
		})
	}

	/// Returns a pull iterator over events matching the selector.
	pub fn iter(&self, selector: impl Into<Selector>) -> Result<EventIter> {
		EventIter::new(self.clone(), selector.into())
	}

	/// Returns a scoped observer bound to this router. All subscriptions made
	/// through the observer are released by a single
	/// [`cleanup`](ChildObserver::cleanup) (or by dropping it).
	pub fn observer(&self) -> ChildObserver {
		ChildObserver::new(self.clone())
	}

	fn register(
		&self,
		selector: Selector,
		callback: EventCallback,
		once: bool,
	) -> Result<Subscription> {
		selector.validate()?;
		let entry = ListenerEntry {
			id: next_listener_id(),
			key: callback_key(&callback),
			callback,
			once,
		};
		let key = selector.key().to_string();
		let is_pattern = selector.is_pattern();

		let (id, fresh) = {
			let mut registry = self.inner.registry.lock();
			let inserted = match &selector {
				Selector::Name(name) => registry.insert_literal(name, entry),
				Selector::Pattern(regex) => registry.insert_pattern(regex, entry),
			};
			match inserted {
				Inserted::New(id) => {
					registry.dispatch(&Notice::On {
						event: key.clone(),
						listener: id,
					});
					(id, true)
				}
				Inserted::Existing(id) => (id, false),
			}
		};

		if fresh {
			notify_spy(
				&self.inner,
				SpyAction {
					kind: if once { SpyKind::Once } else { SpyKind::On },
					event: key.clone(),
					data: None,
					listener: Some(id),
				},
			);
		}

		Ok(Subscription::new(id, &self.inner, key, is_pattern))
	}

	/// Emits an event.
	///
	/// Literal selector: listeners registered under that name fire first in
	/// registration order, then pattern listeners whose pattern matches the
	/// name. Pattern selector: every literal name currently registered that
	/// the pattern matches is resolved and its listeners fire.
	///
	/// # Errors
	///
	/// Returns [`Error::InvalidEvent`] for an empty literal name, or the
	/// validator's error when the configured validation hook vetoes the
	/// emission. Router state is unchanged on error.
	pub fn emit(&self, selector: impl Into<Selector>, data: Value) -> Result<()> {
		let selector = selector.into();
		selector.validate()?;
		let validator = self.inner.validator.lock().clone();
		if let Some(validator) = validator {
			validator(&selector, &data)?;
		}
		match &selector {
			Selector::Name(name) => self.emit_literal(name, &data),
			Selector::Pattern(regex) => {
				let names = {
					let registry = self.inner.registry.lock();
					registry.matching_literal_names(regex)
				};
				for name in names {
					self.emit_resolved(&name, &data)?;
				}
				Ok(())
			}
		}
	}

	fn emit_literal(&self, name: &str, data: &Value) -> Result<()> {
		let (literal, patterns) = {
			let mut registry = self.inner.registry.lock();
			let literal = registry.snapshot_literal(name);
			let patterns = registry.snapshot_patterns(name);
			registry.dispatch(&Notice::Emit {
				event: name.to_string(),
			});
			(literal, patterns)
		};
		notify_spy(
			&self.inner,
			SpyAction {
				kind: SpyKind::Emit,
				event: name.to_string(),
				data: Some(data.clone()),
				listener: None,
			},
		);

		let name: Arc<str> = Arc::from(name);
		for callback in literal {
			callback(Event {
				name: Arc::clone(&name),
				data: data.clone(),
				via_pattern: false,
			});
		}
		for callback in patterns {
			callback(Event {
				name: Arc::clone(&name),
				data: data.clone(),
				via_pattern: true,
			});
		}
		Ok(())
	}

	/// Emission of a pattern selector, resolved to one literal name: only
	/// the literal listeners of the resolved name fire.
	fn emit_resolved(&self, name: &str, data: &Value) -> Result<()> {
		let literal = {
			let mut registry = self.inner.registry.lock();
			let literal = registry.snapshot_literal(name);
			registry.dispatch(&Notice::Emit {
				event: name.to_string(),
			});
			literal
		};
		notify_spy(
			&self.inner,
			SpyAction {
				kind: SpyKind::Emit,
				event: name.to_string(),
				data: Some(data.clone()),
				listener: None,
			},
		);

		let name: Arc<str> = Arc::from(name);
		for callback in literal {
			callback(Event {
				name: Arc::clone(&name),
				data: data.clone(),
				via_pattern: false,
			});
		}
		Ok(())
	}

	/// Removes listeners by selector.
	///
	/// - wildcard `"*"`: empties both maps and dispatches a `clear` notice;
	/// - pattern: removes every listener of each literal name the pattern
	///   matches, plus the pattern's own bucket if one is registered under
	///   the identical canonical key;
	/// - literal: removes that name's listeners only.
	pub fn off(&self, selector: impl Into<Selector>) -> Result<()> {
		let selector = selector.into();
		selector.validate()?;
		let key = selector.key().to_string();
		{
			let mut registry = self.inner.registry.lock();
			match &selector {
				_ if selector.is_wildcard() => {
					registry.clear();
				}
				Selector::Name(name) => {
					registry.remove_literal_key(name);
				}
				Selector::Pattern(regex) => {
					for name in registry.matching_literal_names(regex) {
						registry.remove_literal_key(&name);
					}
					registry.remove_pattern_key(regex.as_str());
				}
			}
		}
		notify_spy(
			&self.inner,
			SpyAction {
				kind: SpyKind::Off,
				event: if selector.is_wildcard() {
					"*".to_string()
				} else {
					key
				},
				data: None,
				listener: None,
			},
		);
		Ok(())
	}

	/// Removes a specific callback (by `Arc` identity) from a selector.
	///
	/// With a pattern selector the callback is removed from every matching
	/// literal name and from the identical-key pattern bucket.
	pub fn off_callback(
		&self,
		selector: impl Into<Selector>,
		callback: &EventCallback,
	) -> Result<()> {
		let selector = selector.into();
		selector.validate()?;
		let cb_key = callback_key(callback);
		let key = selector.key().to_string();
		{
			let mut registry = self.inner.registry.lock();
			match &selector {
				Selector::Name(name) => {
					registry.remove_literal_callback(name, cb_key);
				}
				Selector::Pattern(regex) => {
					for name in registry.matching_literal_names(regex) {
						registry.remove_literal_callback(&name, cb_key);
					}
					registry.remove_pattern_callback(regex.as_str(), cb_key);
				}
			}
		}
		notify_spy(
			&self.inner,
			SpyAction {
				kind: SpyKind::Off,
				event: key,
				data: None,
				listener: None,
			},
		);
		Ok(())
	}

	/// Returns true if the selector is registered.
	///
	/// `"*"` is always true. A pattern tests its canonical key in the
	/// pattern map; a literal tests its name in either map.
	pub fn has(&self, selector: impl Into<Selector>) -> bool {
		let selector = selector.into();
		if selector.is_wildcard() {
			return true;
		}
		let registry = self.inner.registry.lock();
		match &selector {
			Selector::Pattern(regex) => registry.patterns.contains_key(regex.as_str()),
			Selector::Name(name) => {
				registry.literal.contains_key(name.as_str())
					|| registry.patterns.contains_key(name.as_str())
			}
		}
	}

	/// Installs a spy invoked on every subscribe, unsubscribe, emit, and
	/// cleanup. Replaces any previously installed spy.
	pub fn spy<F>(&self, spy: F)
	where
		F: Fn(&SpyAction) + Send + Sync + 'static,
	{
		let mut state = self.inner.spy.lock();
		let spy: SpyFn = Arc::new(spy);
		if state.debug {
			// Debug mode stays on top of whatever spy is installed.
			state.pre_debug = Some(Some(Arc::clone(&spy)));
		}
		state.current = Some(spy);
	}

	/// Removes the installed spy (and leaves debug mode untouched).
	pub fn clear_spy(&self) {
		let mut state = self.inner.spy.lock();
		state.current = None;
		if state.debug {
			state.pre_debug = Some(None);
		}
	}

	/// Returns true if a spy is installed.
	pub fn has_spy(&self) -> bool {
		self.inner.spy.lock().current.is_some()
	}

	/// Toggles debug mode.
	///
	/// Enabling wraps the currently installed spy with one that additionally
	/// logs every action (with a captured backtrace) through `tracing`;
	/// disabling restores the previous spy.
	pub fn debug(&self, enabled: bool) {
		let mut state = self.inner.spy.lock();
		if enabled && !state.debug {
			let previous = state.current.clone();
			state.pre_debug = Some(previous.clone());
			state.current = Some(Arc::new(move |action: &SpyAction| {
				let backtrace = std::backtrace::Backtrace::capture();
				tracing::debug!(
					kind = ?action.kind,
					event = %action.event,
					listener = ?action.listener,
					backtrace = %backtrace,
					"event action"
				);
				if let Some(previous) = &previous {
					previous(action);
				}
			}));
			state.debug = true;
		} else if !enabled && state.debug {
			state.current = state.pre_debug.take().unwrap_or(None);
			state.debug = false;
		}
	}

	/// Listener counts and spy presence.
	pub fn facts(&self) -> RouterFacts {
		let registry = self.inner.registry.lock();
		RouterFacts {
			listeners: registry
				.literal
				.iter()
				.map(|(event, entries)| ListenerCount {
					event: event.clone(),
					count: entries.len(),
				})
				.collect(),
			pattern_listeners: registry
				.patterns
				.iter()
				.map(|(event, bucket)| ListenerCount {
					event: event.clone(),
					count: bucket.entries.len(),
				})
				.collect(),
			has_spy: self.has_spy(),
		}
	}

	/// Deep diagnostics snapshot.
	pub fn internals(&self) -> RouterInternals {
		let registry = self.inner.registry.lock();
		let spy = self.inner.spy.lock();
		RouterInternals {
			listeners: registry
				.literal
				.iter()
				.map(|(event, entries)| InternalEntry {
					event: event.clone(),
					listeners: entries.iter().map(|e| e.id).collect(),
				})
				.collect(),
			pattern_listeners: registry
				.patterns
				.iter()
				.map(|(event, bucket)| InternalEntry {
					event: event.clone(),
					listeners: bucket.entries.iter().map(|e| e.id).collect(),
				})
				.collect(),
			notice_subscribers: registry.notice_count(),
			has_spy: spy.current.is_some(),
			debug: spy.debug,
		}
	}

	pub(crate) fn register_notice(&self, callback: NoticeFn) -> u64 {
		self.inner.registry.lock().register_notice(callback)
	}

	pub(crate) fn unregister_notice(&self, id: u64) {
		self.inner.registry.lock().unregister_notice(id);
	}

	pub(crate) fn spy_action(&self, action: SpyAction) {
		notify_spy(&self.inner, action);
	}
}

impl Default for EventRouter {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Debug for EventRouter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let registry = self.inner.registry.lock();
		f.debug_struct("EventRouter")
			.field("literal_keys", &registry.literal.len())
			.field("pattern_keys", &registry.patterns.len())
			.finish()
	}
}

/// RAII handle that removes a listener on drop.
///
/// Holds a weak reference to the router, so dropping after the router is
/// gone is a no-op.
pub struct Subscription {
	id: ListenerId,
	detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
	fn new(id: ListenerId, inner: &Arc<RouterInner>, key: String, is_pattern: bool) -> Self {
		let weak: Weak<RouterInner> = Arc::downgrade(inner);
		Self {
			id,
			detach: Some(Box::new(move || {
				if let Some(inner) = weak.upgrade() {
					let removed = inner.registry.lock().remove_id(&key, is_pattern, id);
					if removed {
						notify_spy(
							&inner,
							SpyAction {
								kind: SpyKind::Off,
								event: key,
								data: None,
								listener: Some(id),
							},
						);
					}
				}
			})),
		}
	}

	/// Returns this subscription's listener ID.
	pub fn id(&self) -> ListenerId {
		self.id
	}

	/// Explicitly unsubscribes. Equivalent to dropping.
	pub fn unsubscribe(mut self) {
		if let Some(detach) = self.detach.take() {
			detach();
		}
	}

	/// Disarms the handle without unsubscribing. The listener stays
	/// registered until removed by some other path.
	pub fn forget(mut self) {
		self.detach = None;
	}

	/// Unsubscribes when the signal trips, deferred by one scheduling tick
	/// so emissions already dispatched on other tasks land first. A dropped
	/// sender never trips the signal.
	pub fn detach_on(self, signal: oneshot::Receiver<()>) {
		tokio::spawn(async move {
			if signal.await.is_ok() {
				tokio::task::yield_now().await;
				self.unsubscribe();
			}
		});
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		if let Some(detach) = self.detach.take() {
			detach();
		}
	}
}

impl std::fmt::Debug for Subscription {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Subscription")
			.field("id", &self.id)
			.field("active", &self.detach.is_some())
			.finish()
	}
}

/// Future resolving with the next event matching a selector.
///
/// Returned by [`EventRouter::next_event`]. Dropping it before resolution
/// detaches the underlying one-shot subscription.
pub struct NextEvent {
	rx: oneshot::Receiver<Event>,
	subscription: Option<Subscription>,
}

impl NextEvent {
	/// Detaches without waiting. Equivalent to dropping.
	pub fn cancel(self) {}
}

impl std::future::Future for NextEvent {
	type Output = Result<Event>;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = self.get_mut();
		match Pin::new(&mut this.rx).poll(cx) {
			Poll::Ready(Ok(event)) => {
				// The one-shot entry already removed itself at delivery.
				if let Some(subscription) = this.subscription.take() {
					subscription.forget();
				}
				Poll::Ready(Ok(event))
			}
			Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Detached)),
			Poll::Pending => Poll::Pending,
		}
	}
}

impl std::fmt::Debug for NextEvent {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("NextEvent")
			.field("active", &self.subscription.is_some())
			.finish()
	}
}

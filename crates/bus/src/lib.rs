//! relay - In-process event router
//!
//! Typed event delivery to interested subscribers over two key spaces:
//!
//! - **Literal subscriptions**: exact event names, delivered in registration
//!   order
//! - **Pattern subscriptions**: compiled regular expressions cross-matched
//!   against literal names at emit time (`"*"` is the match-everything
//!   shorthand)
//! - **Pull iteration**: [`EventIter`] exposes a subscription as a lazy,
//!   cancellable sequence
//! - **Scoped observers**: [`ChildObserver`] bundles subscriptions so one
//!   cleanup call detaches them all
//! - **Instrumentation**: a spy hook over every subscribe/unsubscribe/emit/
//!   cleanup, with a `tracing`-backed debug mode
//!
//! # Delivery model
//!
//! Emission is synchronous and runs to completion: the matching listeners
//! are snapshotted under the registry lock and invoked after it is released,
//! literal subscribers first (in registration order), then pattern
//! subscribers whose pattern matches the emitted name. There is no ordering
//! guarantee across emissions of different names.
//!
//! # Example
//!
//! ```ignore
//! use relay::EventRouter;
//! use serde_json::json;
//!
//! let router = EventRouter::new();
//! let _sub = router.on("tick", |event| {
//!     println!("{} = {}", event.name, event.data);
//! })?;
//! router.emit("tick", json!(7))?;
//! ```

pub mod error;
pub mod iterator;
pub mod observer;
pub mod registry;
pub mod router;
pub mod selector;

// Re-export key types at crate root
pub use error::{Error, Result};
pub use iterator::EventIter;
pub use observer::ChildObserver;
pub use registry::{Event, EventCallback, ListenerId};
pub use router::{
	EventRouter, ListenerCount, NextEvent, RouterFacts, RouterInternals, SpyAction, SpyFn, SpyKind,
	Subscription, ValidatorFn,
};
pub use selector::Selector;

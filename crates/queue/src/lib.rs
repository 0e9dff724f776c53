//! relay-queue - Event-driven work queue
//!
//! Converts an event stream on a [`relay`] router into controlled background
//! work:
//!
//! - **Admission through the router**: `add` emits the bound event; the
//!   queue's listener buffers `{task-id, data, priority}`, so external
//!   emissions of the same event are admitted identically
//! - **Priority buffer**: highest priority first, FIFO/LIFO tie-break
//! - **Bounded worker pool**: `concurrency` tokio tasks per generation;
//!   pause/resume/stop retire workers by advancing the generation
//! - **Token-bucket rate limiting** with a throttle notification event
//! - **Lifecycle control**: a four-state machine guards
//!   start/pause/resume/stop/drain, and every phase is announced back
//!   through the router under `queue:<name>:<phase>` in a sentinel envelope
//! - **Statistics** derived purely from those events
//!
//! # Example
//!
//! ```ignore
//! use relay::EventRouter;
//! use relay_queue::{QueueConfig, WorkQueue, task_fn};
//! use serde_json::json;
//!
//! let router = EventRouter::new();
//! let queue = WorkQueue::new(
//!     router.clone(),
//!     "jobs",
//!     task_fn(|data| async move { Ok(data) }),
//!     QueueConfig::new("mailer").concurrency(2),
//! )?;
//! queue.start()?;
//! queue.add(json!({"to": "someone@example.com"}));
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod events;
pub mod limiter;
pub mod queue;
pub mod state;
pub mod stats;

// Re-export key types at crate root
pub use buffer::{PriorityBuffer, QueueItem, TaskId};
pub use config::{DebugLevel, QueueConfig, QueueKind};
pub use error::{QueueError, Result};
pub use events::{QueueEvent, QueuePhase, RejectReason, event_name};
pub use limiter::{LimiterSnapshot, RateLimiter};
pub use queue::{QueueSnapshot, TaskFn, TaskFuture, WorkQueue, task_fn};
pub use state::QueueState;
pub use stats::QueueStats;

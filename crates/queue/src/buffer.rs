//! Priority-ordered item buffer.
//!
//! Items are served highest priority first; ties follow the configured
//! discipline (FIFO or LIFO), implemented as a sequence number folded into
//! the heap ordering. Requeued items (a worker observed a state change after
//! popping) go back to the head under FIFO and to the tail under LIFO, via a
//! separate reinsertion sequence that sorts outside the arrival range.

use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;

use crate::config::QueueKind;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique opaque task identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
	/// Returns a new process-wide unique ID.
	pub(crate) fn next() -> Self {
		Self(NEXT_TASK_ID.fetch_add(1, Ordering::SeqCst))
	}

	pub fn value(self) -> u64 {
		self.0
	}
}

impl fmt::Display for TaskId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "task-{}", self.0)
	}
}

/// A buffered unit of work.
#[derive(Clone, Debug, Serialize)]
pub struct QueueItem {
	pub id: TaskId,
	pub data: Value,
	pub priority: i64,
}

struct Slot {
	priority: i64,
	seq: i64,
	item: QueueItem,
}

impl PartialEq for Slot {
	fn eq(&self, other: &Self) -> bool {
		self.priority == other.priority && self.seq == other.seq
	}
}

impl Eq for Slot {}

impl PartialOrd for Slot {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Slot {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.priority
			.cmp(&other.priority)
			.then(self.seq.cmp(&other.seq))
	}
}

/// Max-priority buffer with configurable tie-break discipline.
pub struct PriorityBuffer {
	heap: BinaryHeap<Slot>,
	kind: QueueKind,
	arrivals: u64,
	reinserts: u64,
}

impl PriorityBuffer {
	pub fn new(kind: QueueKind) -> Self {
		Self {
			heap: BinaryHeap::new(),
			kind,
			arrivals: 0,
			reinserts: 0,
		}
	}

	pub fn kind(&self) -> QueueKind {
		self.kind
	}

	/// Buffers an item at its recorded priority.
	pub fn push(&mut self, item: QueueItem) {
		self.arrivals += 1;
		// FIFO pops the numerically greatest sequence, so arrivals count
		// downward; LIFO counts upward.
		let seq = match self.kind {
			QueueKind::Fifo => -(self.arrivals as i64),
			QueueKind::Lifo => self.arrivals as i64,
		};
		self.heap.push(Slot {
			priority: item.priority,
			seq,
			item,
		});
	}

	/// Puts a popped item back: head of its priority band under FIFO, tail
	/// under LIFO.
	pub fn requeue(&mut self, item: QueueItem) {
		self.reinserts += 1;
		let seq = match self.kind {
			QueueKind::Fifo => self.reinserts as i64,
			QueueKind::Lifo => -(self.reinserts as i64),
		};
		self.heap.push(Slot {
			priority: item.priority,
			seq,
			item,
		});
	}

	/// Removes and returns the next item, if any.
	pub fn pop(&mut self) -> Option<QueueItem> {
		self.heap.pop().map(|slot| slot.item)
	}

	/// Removes and returns up to `n` items in serving order.
	pub fn pop_many(&mut self, n: usize) -> Vec<QueueItem> {
		let mut items = Vec::with_capacity(n.min(self.heap.len()));
		while items.len() < n {
			match self.heap.pop() {
				Some(slot) => items.push(slot.item),
				None => break,
			}
		}
		items
	}

	pub fn len(&self) -> usize {
		self.heap.len()
	}

	pub fn is_empty(&self) -> bool {
		self.heap.is_empty()
	}

	/// Discards everything. Returns how many items were dropped.
	pub fn clear(&mut self) -> usize {
		let count = self.heap.len();
		self.heap.clear();
		count
	}
}

impl fmt::Debug for PriorityBuffer {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PriorityBuffer")
			.field("kind", &self.kind)
			.field("len", &self.heap.len())
			.finish()
	}
}

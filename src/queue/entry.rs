//! Waiting-list entries and their dispatch ordering.

use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;

/// The boxed future a [`Job`] hands to the dispatch loop.
pub(crate) type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A type-erased unit of work. Calling it starts the task and returns a
/// future that runs it to completion and settles the caller's channel.
pub(crate) type Job = Box<dyn FnOnce() -> JobFuture + Send>;

/// One pending request in the waiting list.
pub(crate) struct QueueEntry {
    pub(crate) priority: i32,
    // Insertion counter; lower values were submitted earlier.
    pub(crate) seq: u64,
    pub(crate) job: Job,
}

impl QueueEntry {
    pub(crate) fn new(priority: i32, seq: u64, job: Job) -> Self {
        Self { priority, seq, job }
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    /// `BinaryHeap` pops the greatest element, so higher priority compares
    /// greater and, within a priority, the earlier submission compares greater.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

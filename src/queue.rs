//! # Pending event buffering.
//!
//! Events for a worker that is absent or not yet ready are buffered here and
//! flushed, in arrival order, once the worker announces readiness. Entries
//! belonging to other workers stay queued; entries are never reordered.
//!
//! Each bucket is bounded: past the limit the oldest entry is dropped, so the
//! buffer converges toward events the worker can still act on while the
//! relative order of survivors is preserved. Events for shards no worker owns
//! go into per-shard buckets under the same bound; those buckets are only
//! ever cleared (full reload or shutdown), never flushed.

use std::collections::{HashMap, VecDeque};

use crate::message::ShardEvent;
use crate::plan::{ShardId, WorkerId};

/// Key of one pending bucket.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum QueueKey {
    Worker(WorkerId),
    /// Shard with no owner in the active plan.
    Unowned(ShardId),
}

/// Bounded FIFO buffers of undeliverable events, one per worker.
#[derive(Debug)]
pub struct PendingQueue {
    limit: usize,
    buckets: HashMap<QueueKey, VecDeque<ShardEvent>>,
}

impl PendingQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            buckets: HashMap::new(),
        }
    }

    /// Appends an event; returns the dropped entry when the bucket was full.
    pub fn push(&mut self, key: QueueKey, event: ShardEvent) -> Option<ShardEvent> {
        let bucket = self.buckets.entry(key).or_default();
        let dropped = if bucket.len() >= self.limit {
            bucket.pop_front()
        } else {
            None
        };
        bucket.push_back(event);
        dropped
    }

    /// Oldest queued event for a worker, without removing it.
    pub fn peek(&self, worker: &str) -> Option<&ShardEvent> {
        self.buckets
            .get(&QueueKey::Worker(worker.to_string()))
            .and_then(VecDeque::front)
    }

    /// Removes and returns the oldest queued event for a worker.
    pub fn pop(&mut self, worker: &str) -> Option<ShardEvent> {
        let key = QueueKey::Worker(worker.to_string());
        let bucket = self.buckets.get_mut(&key)?;
        let event = bucket.pop_front();
        if bucket.is_empty() {
            self.buckets.remove(&key);
        }
        event
    }

    /// Whether a worker has anything buffered.
    pub fn has_pending(&self, worker: &str) -> bool {
        self.buckets
            .get(&QueueKey::Worker(worker.to_string()))
            .is_some_and(|b| !b.is_empty())
    }

    pub fn len_for(&self, worker: &str) -> usize {
        self.buckets
            .get(&QueueKey::Worker(worker.to_string()))
            .map_or(0, VecDeque::len)
    }

    /// Worker ids that currently have buffered events.
    pub fn workers_with_pending(&self) -> Vec<WorkerId> {
        self.buckets
            .keys()
            .filter_map(|k| match k {
                QueueKey::Worker(id) => Some(id.clone()),
                QueueKey::Unowned(_) => None,
            })
            .collect()
    }

    /// Drops everything. Used on full reload and shutdown.
    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    pub fn total_len(&self) -> usize {
        self.buckets.values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(shard: ShardId, n: u64) -> ShardEvent {
        ShardEvent {
            shard_id: shard,
            payload: json!({ "seq": n }),
        }
    }

    fn wkey(id: &str) -> QueueKey {
        QueueKey::Worker(id.to_string())
    }

    #[test]
    fn preserves_arrival_order_per_worker() {
        let mut q = PendingQueue::new(16);
        q.push(wkey("w0"), ev(0, 1));
        q.push(wkey("w1"), ev(2, 2));
        q.push(wkey("w0"), ev(1, 3));

        assert_eq!(q.pop("w0").unwrap().payload["seq"], 1);
        assert_eq!(q.pop("w0").unwrap().payload["seq"], 3);
        assert!(q.pop("w0").is_none());
        // other workers' entries stay queued
        assert_eq!(q.pop("w1").unwrap().payload["seq"], 2);
    }

    #[test]
    fn overflow_drops_the_oldest_entry() {
        let mut q = PendingQueue::new(2);
        assert!(q.push(wkey("w0"), ev(0, 1)).is_none());
        assert!(q.push(wkey("w0"), ev(0, 2)).is_none());
        let dropped = q.push(wkey("w0"), ev(0, 3)).unwrap();
        assert_eq!(dropped.payload["seq"], 1);

        assert_eq!(q.pop("w0").unwrap().payload["seq"], 2);
        assert_eq!(q.pop("w0").unwrap().payload["seq"], 3);
    }

    #[test]
    fn bound_applies_per_bucket() {
        let mut q = PendingQueue::new(1);
        assert!(q.push(wkey("w0"), ev(0, 1)).is_none());
        assert!(q.push(wkey("w1"), ev(1, 2)).is_none());
        assert_eq!(q.total_len(), 2);
    }

    #[test]
    fn unowned_buckets_count_but_never_flush_to_workers() {
        let mut q = PendingQueue::new(4);
        q.push(QueueKey::Unowned(9), ev(9, 1));
        assert_eq!(q.total_len(), 1);
        assert!(q.workers_with_pending().is_empty());
        q.clear();
        assert_eq!(q.total_len(), 0);
    }

    #[test]
    fn clear_empties_everything() {
        let mut q = PendingQueue::new(4);
        q.push(wkey("w0"), ev(0, 1));
        q.push(wkey("w1"), ev(1, 2));
        q.clear();
        assert_eq!(q.total_len(), 0);
        assert!(!q.has_pending("w0"));
    }
}

//! # Request/response correlation.
//!
//! [`Correlations`] maps a caller-generated nonce to the requesting worker's
//! reply channel, so the asynchronous response coming back from the
//! connection process finds its way to whichever worker asked the question
//! and the entry is discarded. Entries have a finite lifetime: a periodic
//! sweep evicts whatever was never answered, which bounds the map without
//! relying on the allocator to clean up after forgotten requests. A response
//! arriving after eviction finds no entry and is a no-op.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::message::ShardInfoReply;
use crate::plan::WorkerId;

#[derive(Debug)]
struct Entry {
    worker_id: WorkerId,
    reply: oneshot::Sender<ShardInfoReply>,
    deadline: Instant,
}

/// Finite-lifetime map of in-flight correlated requests.
#[derive(Debug)]
pub struct Correlations {
    ttl: Duration,
    entries: HashMap<Uuid, Entry>,
}

impl Correlations {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Records an in-flight request from `worker_id` under `nonce`.
    pub fn insert(
        &mut self,
        nonce: Uuid,
        worker_id: WorkerId,
        reply: oneshot::Sender<ShardInfoReply>,
    ) {
        self.entries.insert(
            nonce,
            Entry {
                worker_id,
                reply,
                deadline: Instant::now() + self.ttl,
            },
        );
    }

    /// Resolves a response: removes the entry and returns its reply channel,
    /// or `None` when the nonce is unknown or already expired.
    pub fn take(&mut self, nonce: &Uuid) -> Option<oneshot::Sender<ShardInfoReply>> {
        let entry = self.entries.remove(nonce)?;
        if entry.deadline < Instant::now() {
            return None;
        }
        Some(entry.reply)
    }

    /// Removes the entry without answering it, e.g. when forwarding the
    /// request to the connection process failed. Dropping the reply channel
    /// surfaces as a timeout on the caller's side.
    pub fn cancel(&mut self, nonce: &Uuid) {
        self.entries.remove(nonce);
    }

    /// Evicts expired entries, returning the requesters that never got an
    /// answer.
    pub fn sweep(&mut self) -> Vec<(Uuid, WorkerId)> {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline < now)
            .map(|(nonce, _)| *nonce)
            .collect();
        expired
            .into_iter()
            .filter_map(|nonce| {
                self.entries
                    .remove(&nonce)
                    .map(|e| (nonce, e.worker_id))
            })
            .collect()
    }

    /// Drops every in-flight entry. Used on full reload and shutdown.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

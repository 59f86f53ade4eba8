//! The `Subscription` record shared between a connection and the account matcher.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::subject::Subject;

/// Opaque, connection-scoped subscription identifier. Unique within the
/// owning connection; `(ConnectionId, SubscriptionId)` is globally unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Bytes);

impl SubscriptionId {
    pub fn new(raw: impl Into<Bytes>) -> Self {
        SubscriptionId(raw.into())
    }
}

/// Monotonic connection identifier, assigned by the server core on accept/dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// One expression of interest in a subject pattern.
///
/// Shared via `Arc` between its owning connection's subscription table and
/// the account matcher: both must see the same delivery counter so
/// auto-unsubscribe fires exactly once regardless of which side observes
/// the cap first.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub account: String,
    pub subject: Subject,
    pub queue: Option<Bytes>,
    pub owner: ConnectionId,
    /// -1 means unlimited. Stored as an atomic (rather than `Option<u64>`)
    /// so `UNSUB <sid> <max>` can tighten an already-registered
    /// subscription's cap in place, without a remove/reinsert cycle that
    /// would otherwise touch the account's route-interest refcount.
    max_deliveries: AtomicI64,
    delivered: AtomicU64,
}

impl Subscription {
    pub fn new(
        id: SubscriptionId,
        account: impl Into<String>,
        subject: Subject,
        queue: Option<Bytes>,
        owner: ConnectionId,
        max_deliveries: Option<u64>,
    ) -> Arc<Subscription> {
        Arc::new(Subscription {
            id,
            account: account.into(),
            subject,
            queue,
            owner,
            max_deliveries: AtomicI64::new(max_deliveries.map(|m| m as i64).unwrap_or(-1)),
            delivered: AtomicU64::new(0),
        })
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn max_deliveries(&self) -> Option<u64> {
        match self.max_deliveries.load(Ordering::SeqCst) {
            m if m < 0 => None,
            m => Some(m as u64),
        }
    }

    /// Tightens (or clears) the delivery cap. Used by `UNSUB <sid> <max>`.
    pub fn set_max_deliveries(&self, max: Option<u64>) {
        self.max_deliveries.store(max.map(|m| m as i64).unwrap_or(-1), Ordering::SeqCst);
    }

    /// Records one delivery. Returns `true` if the subscription just hit (or
    /// already sat at) its delivery cap and must be removed from both the
    /// owning connection and the account matcher.
    pub fn record_delivery(&self) -> bool {
        let delivered = self.delivered.fetch_add(1, Ordering::SeqCst) + 1;
        match self.max_deliveries() {
            Some(max) => delivered >= max,
            None => false,
        }
    }

    pub fn is_queue(&self) -> bool {
        self.queue.is_some()
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.owner == other.owner
    }
}
impl Eq for Subscription {}

//! C2 — Account: the isolation boundary. Owns one `Matcher` plus the
//! route-interest refcounts that drive coalesced `RS+`/`RS-` propagation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};

use crate::error::AccountError;
use crate::matcher::{MatchResult, Matcher};
use crate::subject::Subject;
use crate::subscription::{ConnectionId, Subscription, SubscriptionId};

/// Key into an account's route-interest refcount table.
type InterestKey = (String, Option<Bytes>);

/// Whether a local subscribe/unsubscribe just crossed the 0/1 boundary for
/// its `(subject, queue)` key. Routes only need to hear about the edges,
/// not every local subscription — this is the coalescing contract of
/// spec.md §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestEdge {
    /// Refcount went from 0 to 1: emit `RS+` on every route.
    Appeared { weight: u64 },
    /// Refcount changed but is still > 0 (queue group grew/shrank): update
    /// the outstanding `RS+` weight, do not emit a fresh one.
    WeightChanged { weight: u64 },
    /// Refcount dropped to 0: emit `RS-` on every route.
    Disappeared,
}

pub struct Account {
    pub name: String,
    matcher: Matcher,
    route_interest_refcount: RwLock<HashMap<InterestKey, u64>>,
    client_set: RwLock<HashSet<ConnectionId>>,
    last_empty_at: Mutex<Option<Instant>>,
    sub_count: AtomicI64,
    /// Monotonic counter, used only to assign stable keys to newly created
    /// accounts in logs/tests.
    created_at: AtomicU64,
}

impl Account {
    pub fn new(name: impl Into<String>) -> Arc<Account> {
        Arc::new(Account {
            name: name.into(),
            matcher: Matcher::new(),
            route_interest_refcount: RwLock::new(HashMap::new()),
            client_set: RwLock::new(HashSet::new()),
            last_empty_at: Mutex::new(None),
            sub_count: AtomicI64::new(0),
            created_at: AtomicU64::new(0),
        })
    }

    pub async fn register_client(&self, id: ConnectionId) {
        self.client_set.write().await.insert(id);
        *self.last_empty_at.lock().await = None;
    }

    pub async fn unregister_client(&self, id: ConnectionId) {
        self.client_set.write().await.remove(&id);
        self.mark_if_empty().await;
    }

    /// Adds `sub` to the matcher and updates the route-interest refcount
    /// for its `(subject, queue)` key in the same logical operation —
    /// spec.md §5 requires these be atomic with respect to each other.
    pub async fn subscribe(&self, sub: Arc<Subscription>) -> Result<InterestEdge, AccountError> {
        let key = (sub.subject.as_string(), sub.queue.clone());
        self.matcher.insert(sub.clone()).await?;
        self.sub_count.fetch_add(1, Ordering::SeqCst);

        let mut refcounts = self.route_interest_refcount.write().await;
        let count = refcounts.entry(key).or_insert(0);
        *count += 1;
        let edge = if *count == 1 {
            InterestEdge::Appeared { weight: *count }
        } else {
            InterestEdge::WeightChanged { weight: *count }
        };
        Ok(edge)
    }

    /// Removes `sub` from the matcher. Returns the interest edge, if any
    /// (a removal for an id that was never inserted produces no edge).
    pub async fn unsubscribe(&self, subject: &Subject, queue: Option<&Bytes>, sub_id: &SubscriptionId, owner: ConnectionId) -> Option<InterestEdge> {
        self.matcher.remove(subject, sub_id, owner).await;
        self.sub_count.fetch_sub(1, Ordering::SeqCst);

        let key = (subject.as_string(), queue.cloned());
        let mut refcounts = self.route_interest_refcount.write().await;
        let edge = match refcounts.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Some(InterestEdge::WeightChanged { weight: *count })
            }
            Some(count) if *count == 1 => {
                refcounts.remove(&key);
                Some(InterestEdge::Disappeared)
            }
            _ => None,
        };
        drop(refcounts);
        self.mark_if_empty().await;
        edge
    }

    pub async fn publish(&self, subject: &Subject) -> MatchResult {
        self.matcher.matches(subject).await
    }

    pub async fn has_interest(&self, subject: &Subject) -> bool {
        self.matcher.has_interest(subject).await
    }

    pub async fn num_subscriptions(&self) -> usize {
        self.matcher.count().await
    }

    /// The current set of `(subject, queue, weight)` this account has local
    /// interest in, for full replay to a route on (re)connect.
    pub async fn interest_snapshot(&self) -> Vec<(String, Option<Bytes>, u64)> {
        self.route_interest_refcount
            .read()
            .await
            .iter()
            .map(|((subject, queue), weight)| (subject.clone(), queue.clone(), *weight))
            .collect()
    }

    async fn mark_if_empty(&self) {
        let empty = self.client_set.read().await.is_empty() && self.route_interest_refcount.read().await.is_empty();
        let mut last_empty_at = self.last_empty_at.lock().await;
        if empty {
            if last_empty_at.is_none() {
                *last_empty_at = Some(Instant::now());
            }
        } else {
            *last_empty_at = None;
        }
    }

    /// Whether this account has sat idle (no clients, no route interest)
    /// for at least `grace`. Used by the registry's sweep.
    async fn removable(&self, grace: Duration) -> bool {
        match *self.last_empty_at.lock().await {
            Some(since) => since.elapsed() >= grace,
            None => false,
        }
    }
}

/// Owns every account; creates on first reference, destroys after the
/// configured grace period once a sweep observes it idle.
pub struct Registry {
    accounts: RwLock<HashMap<String, Arc<Account>>>,
    grace: Duration,
}

impl Registry {
    pub fn new(grace: Duration) -> Registry {
        Registry { accounts: RwLock::new(HashMap::new()), grace }
    }

    pub async fn get_or_create(&self, name: &str) -> Arc<Account> {
        if let Some(acc) = self.accounts.read().await.get(name) {
            return acc.clone();
        }
        let mut accounts = self.accounts.write().await;
        accounts.entry(name.to_owned()).or_insert_with(|| Account::new(name)).clone()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Account>> {
        self.accounts.read().await.get(name).cloned()
    }

    /// Removes every account that has been idle for at least the grace
    /// period. Called periodically by the server core.
    pub async fn sweep(&self) {
        let mut dead = Vec::new();
        {
            let accounts = self.accounts.read().await;
            for (name, acc) in accounts.iter() {
                if acc.removable(self.grace).await {
                    dead.push(name.clone());
                }
            }
        }
        if !dead.is_empty() {
            let mut accounts = self.accounts.write().await;
            for name in dead {
                accounts.remove(&name);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn names(&self) -> Vec<String> {
        self.accounts.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::subscription::ConnectionId;

    fn make_sub(subject: &str, queue: Option<&str>, owner: u64) -> Arc<Subscription> {
        Subscription::new(
            SubscriptionId::new(Bytes::from_static(b"1")),
            "A",
            Subject::parse_pattern(subject).unwrap(),
            queue.map(|q| Bytes::copy_from_slice(q.as_bytes())),
            ConnectionId(owner),
            None,
        )
    }

    #[tokio::test]
    async fn first_local_sub_reports_appeared() {
        let acc = Account::new("A");
        let sub = make_sub("foo", None, 1);
        let edge = acc.subscribe(sub).await.unwrap();
        assert_eq!(edge, InterestEdge::Appeared { weight: 1 });
    }

    #[tokio::test]
    async fn coalesces_multiple_local_subs_into_one_edge() {
        let acc = Account::new("A");
        let s1 = make_sub("foo", Some("qg"), 1);
        let s2 = Subscription::new(
            SubscriptionId::new(Bytes::from_static(b"2")),
            "A",
            Subject::parse_pattern("foo").unwrap(),
            Some(Bytes::from_static(b"qg")),
            ConnectionId(2),
            None,
        );
        let e1 = acc.subscribe(s1).await.unwrap();
        let e2 = acc.subscribe(s2).await.unwrap();
        assert_eq!(e1, InterestEdge::Appeared { weight: 1 });
        assert_eq!(e2, InterestEdge::WeightChanged { weight: 2 });
    }

    #[tokio::test]
    async fn last_unsub_reports_disappeared() {
        let acc = Account::new("A");
        let sub = make_sub("foo", None, 1);
        acc.subscribe(sub.clone()).await.unwrap();
        let edge = acc.unsubscribe(&sub.subject, sub.queue.as_ref(), &sub.id, sub.owner).await;
        assert_eq!(edge, Some(InterestEdge::Disappeared));
    }

    #[tokio::test]
    async fn account_removal_rejected_while_subs_remain() {
        // modeled as: account never reports removable() while refcounts exist
        let acc = Account::new("A");
        let sub = make_sub("foo", None, 1);
        acc.subscribe(sub).await.unwrap();
        assert!(!acc.removable(Duration::from_millis(0)).await);
    }
}

//! C5 — Interest Propagator: coalesces local subscriptions into outbound
//! `RS+`/`RS-` frames per route and tracks the weight a peer has reported
//! for each queue group we have remote interest in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::RwLock;

use crate::account::{Account, InterestEdge, Registry as AccountRegistry};
use crate::connection::Connection;
use crate::protocol::{encode_rs_minus, encode_rs_plus};

/// `(account, subject, queue)` — the unit routes coalesce on.
type InterestKey = (String, String, Option<Bytes>);

struct Advertisement {
    rsid: Bytes,
    weight: u64,
}

/// Outbound bookkeeping, global to the server (one instance shared by every
/// route connection) since the rsid namespace for our own advertisements
/// only needs to be unique per route, not per process.
pub struct InterestPropagator {
    next_serial: AtomicU64,
    outbound: RwLock<HashMap<crate::subscription::ConnectionId, HashMap<InterestKey, Advertisement>>>,
    /// What a peer on the far side of a route has told us, via inbound
    /// `RS+`/`RS-`, about its own cardinality for a queue group.
    remote_weights: RwLock<HashMap<crate::subscription::ConnectionId, HashMap<InterestKey, u64>>>,
}

impl InterestPropagator {
    pub fn new() -> InterestPropagator {
        InterestPropagator {
            next_serial: AtomicU64::new(1),
            outbound: RwLock::new(HashMap::new()),
            remote_weights: RwLock::new(HashMap::new()),
        }
    }

    fn mint_rsid(&self) -> Bytes {
        let n = self.next_serial.fetch_add(1, Ordering::SeqCst);
        Bytes::from(format!("s{}", n))
    }

    /// Applies one local interest edge to one route connection, enqueuing
    /// the resulting `RS+`/`RS-` frame (or none, for a pure weight update
    /// the peer doesn't need to hear about as a fresh advertisement —
    /// NATS-style cores still resend `RS+` with the new weight so the peer's
    /// distribution stays accurate, which is what we do here too).
    pub async fn apply_edge(&self, route: &Arc<Connection>, account: &str, subject: &str, queue: Option<&Bytes>, edge: InterestEdge) {
        let key: InterestKey = (account.to_owned(), subject.to_owned(), queue.cloned());
        let mut outbound = self.outbound.write().await;
        let per_route = outbound.entry(route.id).or_insert_with(HashMap::new);

        match edge {
            InterestEdge::Appeared { weight } => {
                let rsid = self.mint_rsid();
                let frame = encode_rs_plus(account, subject, queue.map(|q| q.as_ref()), queue.map(|_| weight), &rsid);
                per_route.insert(key, Advertisement { rsid, weight });
                let _ = route.enqueue(frame);
            }
            InterestEdge::WeightChanged { weight } => {
                if let Some(adv) = per_route.get_mut(&key) {
                    adv.weight = weight;
                    let frame = encode_rs_plus(account, subject, queue.map(|q| q.as_ref()), queue.map(|_| weight), &adv.rsid);
                    let _ = route.enqueue(frame);
                }
            }
            InterestEdge::Disappeared => {
                if let Some(adv) = per_route.remove(&key) {
                    let frame = encode_rs_minus(account, subject, queue.map(|q| q.as_ref()), &adv.rsid);
                    let _ = route.enqueue(frame);
                }
            }
        }
    }

    /// Broadcasts one edge to every route in `routes`.
    pub async fn broadcast_edge(&self, routes: &[Arc<Connection>], account: &str, subject: &str, queue: Option<&Bytes>, edge: InterestEdge) {
        for route in routes {
            self.apply_edge(route, account, subject, queue, edge).await;
        }
    }

    /// Replays full current interest to a route that just (re)connected.
    /// Drops any stale outbound bookkeeping for this route first so the
    /// rsid namespace starts clean, matching "both sides replay their full
    /// interest" (spec.md §4.5).
    pub async fn replay(&self, route: &Arc<Connection>, accounts: &AccountRegistry, account_names: &[String]) {
        self.outbound.write().await.remove(&route.id);
        for name in account_names {
            if let Some(acc) = accounts.get(name).await {
                for (subject, queue, weight) in acc.interest_snapshot().await {
                    self.apply_edge(route, name, &subject, queue.as_ref(), InterestEdge::Appeared { weight }).await;
                }
            }
        }
    }

    pub async fn forget_route(&self, route_id: crate::subscription::ConnectionId) {
        self.outbound.write().await.remove(&route_id);
        self.remote_weights.write().await.remove(&route_id);
    }

    /// Records a peer's reported cardinality for `(account, subject,
    /// queue)` on this route — driven by an inbound `RS+` carrying a weight.
    pub async fn record_remote_weight(&self, route_id: crate::subscription::ConnectionId, account: &str, subject: &str, queue: &Bytes, weight: u64) {
        let key: InterestKey = (account.to_owned(), subject.to_owned(), Some(queue.clone()));
        self.remote_weights.write().await.entry(route_id).or_insert_with(HashMap::new).insert(key, weight);
    }

    pub async fn forget_remote_weight(&self, route_id: crate::subscription::ConnectionId, account: &str, subject: &str, queue: &Bytes) {
        let key: InterestKey = (account.to_owned(), subject.to_owned(), Some(queue.clone()));
        if let Some(per_route) = self.remote_weights.write().await.get_mut(&route_id) {
            per_route.remove(&key);
        }
    }

    /// The per-route weights currently known for `(account, subject,
    /// queue)`, for use by the queue-distribution pick.
    pub async fn remote_weights_for(&self, account: &str, subject: &str, queue: &Bytes) -> Vec<(crate::subscription::ConnectionId, u64)> {
        let key: InterestKey = (account.to_owned(), subject.to_owned(), Some(queue.clone()));
        let table = self.remote_weights.read().await;
        table.iter().filter_map(|(route_id, m)| m.get(&key).map(|w| (*route_id, *w))).collect()
    }
}

impl Default for InterestPropagator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::Kind;
    use crate::subscription::ConnectionId;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    fn test_route(id: u64) -> Arc<Connection> {
        let (tx, _rx) = mpsc::channel(64);
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        Connection::new(ConnectionId(id), Kind::Route, addr, tx, 1 << 20)
    }

    #[tokio::test]
    async fn appeared_edge_mints_and_tracks_rsid() {
        let prop = InterestPropagator::new();
        let route = test_route(1);
        prop.apply_edge(&route, "A", "foo", None, InterestEdge::Appeared { weight: 1 }).await;
        let outbound = prop.outbound.read().await;
        assert_eq!(outbound.get(&route.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disappeared_edge_clears_tracked_rsid() {
        let prop = InterestPropagator::new();
        let route = test_route(1);
        prop.apply_edge(&route, "A", "foo", None, InterestEdge::Appeared { weight: 1 }).await;
        prop.apply_edge(&route, "A", "foo", None, InterestEdge::Disappeared).await;
        let outbound = prop.outbound.read().await;
        assert!(outbound.get(&route.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn remote_weight_round_trips() {
        let prop = InterestPropagator::new();
        let q = Bytes::from_static(b"qg");
        prop.record_remote_weight(ConnectionId(9), "A", "foo", &q, 4).await;
        let weights = prop.remote_weights_for("A", "foo", &q).await;
        assert_eq!(weights, vec![(ConnectionId(9), 4)]);
        prop.forget_remote_weight(ConnectionId(9), "A", "foo", &q).await;
        assert!(prop.remote_weights_for("A", "foo", &q).await.is_empty());
    }
}

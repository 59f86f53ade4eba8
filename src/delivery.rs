//! Turns an `Account::publish` match into actual `MSG`/`RMSG` frames on the
//! right connections, applying the queue-preference rule of spec.md §4.5
//! and the single-hop no-self-loop rule of §4.4.

use std::sync::Arc;

use bytes::Bytes;

use crate::connection::Kind;
use crate::matcher::MatchResult;
use crate::protocol::{encode_msg, encode_rmsg};
use crate::queue::{pick_slot, pick_weighted_route, Slot};
use crate::server::ServerShared;

/// Where a publish came from, which bounds how far it may be forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// From a local client: may be delivered locally and forwarded once
    /// per route.
    Client,
    /// From a route: delivered locally only, never re-forwarded (no
    /// gossip of messages between routes).
    Route,
}

pub async fn deliver(server: &Arc<ServerShared>, account: &str, subject: &str, reply: Option<&str>, payload: &Bytes, result: MatchResult, origin: Origin) {
    deliver_plain(server, subject, reply, payload, &result, origin).await;
    for (queue, members) in result.queues {
        deliver_queue(server, account, subject, reply, payload, &queue, &members, origin).await;
    }
}

async fn deliver_plain(server: &Arc<ServerShared>, subject: &str, reply: Option<&str>, payload: &Bytes, result: &MatchResult, origin: Origin) {
    for sub in &result.plain {
        let conn = match find_connection(server, sub.owner).await {
            Some(c) => c,
            None => continue,
        };
        if conn.kind == Kind::Route && origin == Origin::Route {
            continue; // no-self-loop: never bounce a route message to another route
        }

        let frame = match conn.kind {
            Kind::Client => encode_msg(subject, &sub.id.0, reply, payload),
            Kind::Route => encode_rmsg(&sub.account, subject, reply, &[], payload),
        };
        let _ = conn.enqueue(frame);
        finish_delivery(server, &conn, sub).await;
    }
}

async fn deliver_queue(
    server: &Arc<ServerShared>,
    account: &str,
    subject: &str,
    reply: Option<&str>,
    payload: &Bytes,
    queue: &Bytes,
    members: &[Arc<crate::subscription::Subscription>],
    origin: Origin,
) {
    if members.is_empty() {
        return;
    }

    // Split members into local client subscribers and the (at most one
    // per route) synthetic subscriptions representing remote interest.
    let mut local = Vec::new();
    let mut route_owners = Vec::new();
    for sub in members {
        match find_connection(server, sub.owner).await {
            Some(conn) if conn.kind == Kind::Client => local.push(sub.clone()),
            Some(conn) if conn.kind == Kind::Route => route_owners.push((conn, sub.clone())),
            _ => {}
        }
    }

    if origin == Origin::Route {
        // A message arriving via a route naming this queue group in its
        // queue-list must land on exactly one local member; it is never
        // re-forwarded to another route.
        if let Some(Slot::Local(idx)) = pick_slot(local.len(), 0, false) {
            let sub = &local[idx];
            if let Some(conn) = find_connection(server, sub.owner).await {
                let frame = encode_msg(subject, &sub.id.0, reply, payload);
                let _ = conn.enqueue(frame);
                finish_delivery(server, &conn, sub).await;
            }
        }
        return;
    }

    let mut route_weights = Vec::new();
    for (conn, _sub) in &route_owners {
        let weights = server.interest.remote_weights_for(account, subject, queue).await;
        for (route_id, w) in weights {
            if route_id == conn.id {
                route_weights.push((conn.clone(), w));
            }
        }
    }
    let n_remote: u64 = route_weights.iter().map(|(_, w)| w).sum();

    match pick_slot(local.len(), n_remote as usize, !route_weights.is_empty()) {
        Some(Slot::Local(idx)) => {
            let sub = &local[idx];
            if let Some(conn) = find_connection(server, sub.owner).await {
                let frame = encode_msg(subject, &sub.id.0, reply, payload);
                let _ = conn.enqueue(frame);
                finish_delivery(server, &conn, sub).await;
            }
        }
        Some(Slot::Remote) => {
            let weighted: Vec<(usize, u64)> = route_weights.iter().enumerate().map(|(i, (_, w))| (i, *w)).collect();
            if let Some(idx) = pick_weighted_route(&weighted) {
                let (conn, _) = &route_weights[idx];
                let frame = encode_rmsg(account, subject, reply, &[queue.clone()], payload);
                let _ = conn.enqueue(frame);
            }
        }
        None => {}
    }
}

async fn find_connection(server: &Arc<ServerShared>, id: crate::subscription::ConnectionId) -> Option<Arc<crate::connection::Connection>> {
    if let Some(c) = server.clients.read().await.get(&id) {
        return Some(c.clone());
    }
    server.routes.read().await.get(&id).cloned()
}

/// After a delivery, checks whether the subscription just hit its delivery
/// cap (auto-unsubscribe, spec.md §4.3) and if so tears it down on both the
/// connection and the account, broadcasting the resulting `RS-`/weight
/// update to every route exactly as an explicit `UNSUB` would.
async fn finish_delivery(server: &Arc<ServerShared>, conn: &Arc<crate::connection::Connection>, sub: &Arc<crate::subscription::Subscription>) {
    if !sub.record_delivery() {
        return;
    }
    conn.subs.write().await.remove(&sub.id);
    if let Some(acc) = server.accounts.get(&sub.account).await {
        let edge = acc.unsubscribe(&sub.subject, sub.queue.as_ref(), &sub.id, sub.owner).await;
        if let Some(edge) = edge {
            let routes = server.route_list().await;
            server.interest.broadcast_edge(&routes, &sub.account, &sub.subject.as_string(), sub.queue.as_ref(), edge).await;
        }
    }
}

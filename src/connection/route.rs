//! C4 — Route Connection: the inter-server link that exchanges `INFO`,
//! negotiates the cluster name, and carries coalesced interest (`RS+`/`RS-`)
//! and cross-server message fan-out (`RMSG`) — spec.md §4.4.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// How often the read loop wakes up even without incoming data, so it can
/// notice `conn.is_closed()`/`server.is_stopping()` on an otherwise-idle
/// route connection — mirrors `connection::client::READ_POLL_INTERVAL`.
const READ_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);

use crate::connection::{send_protocol_error, Connection, Kind, RemoteSub, State};
use crate::delivery::{self, Origin};
use crate::error::{ClusterError, ProtocolError};
use crate::protocol::{encode_err, encode_info, Decoder, Op, PONG};
use crate::server::ServerShared;
use crate::subject::Subject;
use crate::subscription::{Subscription, SubscriptionId};

/// Drives one route connection end to end. `initial_remote` is `Some` for a
/// route we dialed out to (we already know who we expect to reach); `None`
/// for a route a peer dialed into us.
pub async fn handle(server: Arc<ServerShared>, socket: TcpStream, peer_addr: SocketAddr) {
    let id = server.next_connection_id();
    let (mut reader, mut writer) = tokio::io::split(socket);
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(4096);
    let conn = Connection::new(id, Kind::Route, peer_addr, out_tx, server.limits.max_pending_bytes);

    let write_deadline = server.limits.write_deadline;
    let writer_conn = conn.clone();
    tokio::spawn(async move {
        loop {
            let frame = match timeout(READ_POLL_INTERVAL, out_rx.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => {
                    if writer_conn.is_closed() {
                        break;
                    }
                    continue;
                }
            };
            let len = frame.len();
            if timeout(write_deadline, writer.write_all(&frame)).await.is_err() {
                warn!("route {:?} write deadline exceeded, closing", writer_conn.id);
                writer_conn.mark_closed();
                break;
            }
            writer_conn.account_for_flushed(len);
            if writer_conn.is_closed() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut our_info = server.server_info().await;
    our_info.route_id = Some(server.server_id.clone());
    if conn.enqueue(encode_info(&our_info)).is_err() {
        return;
    }
    conn.set_state(State::AwaitConnect);
    server.register_connection(conn.clone()).await;

    let mut decoder = Decoder::new();
    let mut buf = [0u8; 8192];

    loop {
        if conn.is_closed() || server.is_stopping() {
            break;
        }
        let n = match timeout(READ_POLL_INTERVAL, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("route {:?} read error: {}", conn.id, e);
                break;
            }
            Err(_) => continue,
        };
        decoder.feed(&buf[..n]);

        loop {
            match decoder.next_op() {
                Ok(Some(op)) => {
                    if !dispatch(&server, &conn, op).await {
                        conn.mark_closed();
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = conn.enqueue(encode_err(&e.to_string()));
                    conn.mark_closed();
                    break;
                }
            }
        }
    }

    cleanup(&server, &conn).await;
}

async fn dispatch(server: &Arc<ServerShared>, conn: &Arc<Connection>, op: Op) -> bool {
    match op {
        Op::Info(info) => handle_info(server, conn, *info).await,
        Op::Ping => conn.enqueue(Bytes::from_static(PONG)).is_ok(),
        Op::Pong => true,
        Op::RsPlus { account, subject, queue, weight, rsid } => {
            handle_rs_plus(server, conn, account, subject, queue, weight, rsid).await;
            true
        }
        Op::RsMinus { account, subject, queue, rsid } => {
            handle_rs_minus(server, conn, account, subject, queue, rsid).await;
            true
        }
        Op::RMsg { account, subject, reply, queues, payload } => {
            handle_rmsg(server, account, subject, reply, queues, payload).await;
            true
        }
        Op::Err(reason) => {
            info!("route {:?} reported error: {}", conn.id, reason);
            true
        }
        Op::Ok => true,
        // Client-only verbs on a route connection are a protocol violation.
        Op::Connect(_) | Op::Sub { .. } | Op::Unsub { .. } | Op::Pub { .. } | Op::Msg { .. } => {
            send_protocol_error(conn, ProtocolError::UnknownProtocolOperation)
        }
    }
}

async fn handle_info(server: &Arc<ServerShared>, conn: &Arc<Connection>, info: crate::info::ServerInfo) -> bool {
    if let Some(route_id) = &info.route_id {
        if *route_id == server.server_id {
            warn!("route {:?} is a self-connect, dropping", conn.id);
            return false;
        }
    }

    match negotiate_cluster_name(server, &info.cluster).await {
        Ok(()) => {}
        Err(e) => {
            warn!("route {:?}: {}", conn.id, e);
            let _ = conn.enqueue(encode_err(&e.to_string()));
            return false;
        }
    }

    *conn.cluster_name.write().await = Some(info.cluster.clone());
    conn.set_state(State::Active);

    {
        let mut urls = server.connect_urls.write().await;
        for url in &info.connect_urls {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
    }

    let account_names = server.account_names().await;
    server.interest.replay(conn, &server.accounts, &account_names).await;
    true
}

/// Adopts the peer's cluster name if we have none yet; otherwise requires
/// an exact match (spec.md §4.6 cluster-name convergence).
async fn negotiate_cluster_name(server: &Arc<ServerShared>, theirs: &str) -> Result<(), ClusterError> {
    if theirs.is_empty() {
        return Ok(());
    }
    let mut ours = server.cluster_name.write().await;
    if ours.is_empty() {
        *ours = theirs.to_owned();
        return Ok(());
    }
    if *ours != theirs {
        return Err(ClusterError::ClusterNameMismatch { ours: ours.clone(), theirs: theirs.to_owned() });
    }
    Ok(())
}

async fn handle_rs_plus(server: &Arc<ServerShared>, conn: &Arc<Connection>, account: String, subject: String, queue: Option<Bytes>, weight: Option<u64>, rsid: Bytes) {
    let subject_pattern = match Subject::parse_pattern(&subject) {
        Ok(s) => s,
        Err(e) => {
            let _ = conn.enqueue(encode_err(&e.to_string()));
            return;
        }
    };
    let acc = server.accounts.get_or_create(&account).await;

    if let (Some(queue), Some(weight)) = (&queue, weight) {
        server.interest.record_remote_weight(conn.id, &account, &subject, queue, weight).await;
    }

    // A repeated RS+ for an rsid we already know is a weight update: drop
    // the old synthetic subscription before installing the new one so the
    // matcher and route-interest refcount stay in sync with the peer.
    if let Some(existing) = conn.rsid_to_sub.write().await.remove(&rsid) {
        existing.account.unsubscribe(&existing.sub.subject, existing.sub.queue.as_ref(), &existing.sub.id, conn.id).await;
    }

    let sub_id = SubscriptionId::new(rsid.clone());
    let sub = Subscription::new(sub_id, acc.name.clone(), subject_pattern, queue, conn.id, None);
    if acc.subscribe(sub.clone()).await.is_ok() {
        conn.rsid_to_sub.write().await.insert(rsid, RemoteSub { account: acc, sub });
    }
}

async fn handle_rs_minus(_server: &Arc<ServerShared>, conn: &Arc<Connection>, _account: String, _subject: String, _queue: Option<Bytes>, rsid: Bytes) {
    if let Some(remote) = conn.rsid_to_sub.write().await.remove(&rsid) {
        remote.account.unsubscribe(&remote.sub.subject, remote.sub.queue.as_ref(), &remote.sub.id, conn.id).await;
    }
}

async fn handle_rmsg(server: &Arc<ServerShared>, account: String, subject: String, reply: Option<String>, queues: Vec<Bytes>, payload: Bytes) {
    let acc = match server.accounts.get(&account).await {
        Some(a) => a,
        None => return,
    };
    let subject = match Subject::parse_literal(&subject) {
        Ok(s) => s,
        Err(_) => return,
    };
    let mut result = acc.publish(&subject).await;
    if !queues.is_empty() {
        result.queues.retain(|q, _| queues.contains(q));
    } else {
        result.queues.clear();
    }
    delivery::deliver(server, &account, &subject.as_string(), reply.as_deref(), &payload, result, Origin::Route).await;
}

async fn cleanup(server: &Arc<ServerShared>, conn: &Arc<Connection>) {
    conn.mark_closed();
    server.remove_connection(conn.id, Kind::Route).await;
    server.interest.forget_route(conn.id).await;

    let synthetic: Vec<RemoteSub> = {
        let mut table = conn.rsid_to_sub.write().await;
        table.drain().map(|(_, v)| v).collect()
    };
    for remote in synthetic {
        remote.account.unsubscribe(&remote.sub.subject, remote.sub.queue.as_ref(), &remote.sub.id, conn.id).await;
    }

    info!("route {:?} disconnected", conn.id);
}

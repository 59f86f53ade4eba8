//! C3 — Client Connection: the per-socket task that speaks the client wire
//! protocol (spec.md §4.3) and drives a single connection's state machine
//! through `Init -> AwaitConnect -> Active -> (Draining|Closed)`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{delay_for, timeout};

use crate::connection::{send_protocol_error, Connection, Kind, State};
use crate::delivery::{self, Origin};
use crate::error::ProtocolError;
use crate::protocol::{encode_err, encode_info, Decoder, Op, OK, PING, PONG};
use crate::server::ServerShared;
use crate::subject::Subject;
use crate::subscription::{Subscription, SubscriptionId};

/// Default account name a `CONNECT` binds to when it doesn't name one
/// explicitly (spec.md §3 "Account").
const GLOBAL_ACCOUNT: &str = "$G";

/// How often the read loop wakes up even without incoming data, so it can
/// notice `conn.is_closed()`/`server.is_stopping()` on an otherwise-idle
/// connection.
const READ_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);

pub async fn handle(server: Arc<ServerShared>, mut socket: TcpStream, peer_addr: std::net::SocketAddr) {
    // Spec §4.7: inbound client connections are rejected outright during
    // lame duck, before any state for them is ever registered.
    if server.is_lame_duck() {
        let _ = socket.write_all(&encode_err(&ProtocolError::LameDuckMode.reason())).await;
        let _ = socket.shutdown().await;
        return;
    }

    let id = server.next_connection_id();
    let (mut reader, mut writer) = tokio::io::split(socket);
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(1024);
    let conn = Connection::new(id, Kind::Client, peer_addr, out_tx, server.limits.max_pending_bytes);
    server.register_connection(conn.clone()).await;

    let write_deadline = server.limits.write_deadline;
    let writer_conn = conn.clone();
    tokio::spawn(async move {
        loop {
            let frame = match timeout(READ_POLL_INTERVAL, out_rx.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => {
                    // Nothing queued this tick; still need to notice a close
                    // (e.g. lame duck) on an otherwise silent connection.
                    if writer_conn.is_closed() {
                        break;
                    }
                    continue;
                }
            };
            let len = frame.len();
            let write = writer.write_all(&frame);
            if timeout(write_deadline, write).await.is_err() {
                warn!("client {:?} write deadline exceeded, closing", writer_conn.id);
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

    let info = server.server_info().await;
    if conn.enqueue(encode_info(&info)).is_err() {
        cleanup(&server, &conn).await;
        return;
    }
    conn.set_state(State::AwaitConnect);

    let ping_conn = conn.clone();
    let ping_interval = server.limits.ping_interval;
    let ping_max = server.limits.ping_max as usize;
    tokio::spawn(async move {
        loop {
            delay_for(ping_interval).await;
            if ping_conn.is_closed() {
                break;
            }
            if ping_conn.unanswered_pings.fetch_add(1, Ordering::SeqCst) + 1 > ping_max {
                warn!("client {:?} missed {} pings, closing as stale", ping_conn.id, ping_max);
                ping_conn.mark_closed();
                break;
            }
            if ping_conn.enqueue(Bytes::from_static(PING)).is_err() {
                break;
            }
        }
    });

    let mut decoder = Decoder::new();
    let mut buf = [0u8; 8192];

    loop {
        if conn.is_closed() || server.is_stopping() {
            break;
        }
        // Bounded so an idle connection still notices `mark_closed()` (lame
        // duck, shutdown, slow-consumer) instead of sitting parked in `read`
        // until the peer sends something or hangs up first.
        let n = match timeout(READ_POLL_INTERVAL, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("client {:?} read error: {}", conn.id, e);
                break;
            }
            Err(_) => continue,
        };
        decoder.feed(&buf[..n]);
        if decoder.buffered_len() > server.limits.max_control_line + server.limits.max_payload {
            let _ = conn.enqueue(encode_err("maximum control line or payload size exceeded"));
            break;
        }

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

/// Handles one decoded `Op`. Returns `false` if the connection must close.
async fn dispatch(server: &Arc<ServerShared>, conn: &Arc<Connection>, op: Op) -> bool {
    match op {
        Op::Connect(info) => {
            if conn.state() != State::AwaitConnect && conn.state() != State::Active {
                let _ = conn.enqueue(encode_err("connection already established"));
                return false;
            }
            let account_name = info.account.clone().unwrap_or_else(|| GLOBAL_ACCOUNT.to_owned());
            let account = server.accounts.get_or_create(&account_name).await;
            account.register_client(conn.id).await;
            *conn.account.write().await = Some(account);
            conn.set_state(State::Active);
            if info.verbose {
                let _ = conn.enqueue(Bytes::from_static(OK));
            }
            true
        }
        Op::Ping => conn.enqueue(Bytes::from_static(PONG)).is_ok(),
        Op::Pong => {
            conn.unanswered_pings.store(0, Ordering::SeqCst);
            true
        }
        Op::Sub { subject, queue, sid } => handle_sub(server, conn, subject, queue, sid).await,
        Op::Unsub { sid, max } => {
            handle_unsub(server, conn, sid, max).await;
            true
        }
        Op::Pub { subject, reply, payload } => handle_pub(server, conn, subject, reply, payload).await,
        Op::Err(reason) => {
            info!("client {:?} reported error: {}", conn.id, reason);
            true
        }
        Op::Ok => true,
        // Route-only verbs on a client connection are a protocol violation.
        Op::Info(_) | Op::RsPlus { .. } | Op::RsMinus { .. } | Op::RMsg { .. } | Op::Msg { .. } => {
            send_protocol_error(conn, ProtocolError::UnknownProtocolOperation)
        }
    }
}

async fn handle_sub(server: &Arc<ServerShared>, conn: &Arc<Connection>, subject: String, queue: Option<Bytes>, sid: Bytes) -> bool {
    if conn.state() != State::Active {
        let _ = conn.enqueue(encode_err("not connected"));
        return false;
    }
    let account = match conn.account.read().await.clone() {
        Some(a) => a,
        None => {
            let _ = conn.enqueue(encode_err("not connected"));
            return false;
        }
    };
    let sub_id = SubscriptionId::new(sid);
    if conn.subs.read().await.contains_key(&sub_id) {
        // Spec §4.3: a SUB for a sid already registered on this connection
        // is an error, not a silent overwrite — the matcher entry for the
        // prior sub must survive untouched.
        return send_protocol_error(conn, ProtocolError::DuplicateSubscription);
    }
    if server.limits.max_subscriptions > 0 && conn.subs.read().await.len() >= server.limits.max_subscriptions {
        return send_protocol_error(conn, ProtocolError::MaxSubscriptionsExceeded);
    }
    let subject = match Subject::parse_pattern(&subject) {
        Ok(s) => s,
        Err(e) => {
            let _ = conn.enqueue(encode_err(&e.to_string()));
            return true;
        }
    };
    let sub = Subscription::new(sub_id, account.name.clone(), subject.clone(), queue.clone(), conn.id, None);
    let edge = match account.subscribe(sub.clone()).await {
        Ok(edge) => edge,
        Err(e) => {
            let _ = conn.enqueue(encode_err(&e.to_string()));
            return true;
        }
    };
    conn.subs.write().await.insert(sub.id.clone(), sub);
    let routes = server.route_list().await;
    server.interest.broadcast_edge(&routes, &account.name, &subject.as_string(), queue.as_ref(), edge).await;
    true
}

async fn handle_unsub(server: &Arc<ServerShared>, conn: &Arc<Connection>, sid: Bytes, max: Option<u64>) {
    let sub_id = SubscriptionId::new(sid);
    let sub = match conn.subs.read().await.get(&sub_id).cloned() {
        Some(s) => s,
        None => return,
    };

    if let Some(max) = max {
        // Auto-unsubscribe after `max` more deliveries: tighten the cap
        // relative to what's already been delivered, unless that cap is
        // already satisfied, in which case unsubscribe immediately.
        let target = sub.delivered() + max;
        if sub.delivered() >= target {
            finish_unsub(server, conn, &sub).await;
        } else {
            sub.set_max_deliveries(Some(target));
        }
        return;
    }

    finish_unsub(server, conn, &sub).await;
}

async fn finish_unsub(server: &Arc<ServerShared>, conn: &Arc<Connection>, sub: &Arc<Subscription>) {
    conn.subs.write().await.remove(&sub.id);
    if let Some(account) = server.accounts.get(&sub.account).await {
        let edge = account.unsubscribe(&sub.subject, sub.queue.as_ref(), &sub.id, conn.id).await;
        if let Some(edge) = edge {
            let routes = server.route_list().await;
            server.interest.broadcast_edge(&routes, &sub.account, &sub.subject.as_string(), sub.queue.as_ref(), edge).await;
        }
    }
}

async fn handle_pub(server: &Arc<ServerShared>, conn: &Arc<Connection>, subject: String, reply: Option<String>, payload: Bytes) -> bool {
    if conn.state() != State::Active {
        let _ = conn.enqueue(encode_err("not connected"));
        return false;
    }
    if payload.len() > server.limits.max_payload {
        return send_protocol_error(conn, ProtocolError::MaxPayloadExceeded);
    }
    let account = match conn.account.read().await.clone() {
        Some(a) => a,
        None => {
            let _ = conn.enqueue(encode_err("not connected"));
            return false;
        }
    };
    let subject = match Subject::parse_literal(&subject) {
        Ok(s) => s,
        Err(e) => {
            let _ = conn.enqueue(encode_err(&e.to_string()));
            return true;
        }
    };
    let result = account.publish(&subject).await;
    delivery::deliver(server, &account.name, &subject.as_string(), reply.as_deref(), &payload, result, Origin::Client).await;
    true
}

async fn cleanup(server: &Arc<ServerShared>, conn: &Arc<Connection>) {
    conn.mark_closed();
    server.remove_connection(conn.id, Kind::Client).await;

    let subs: Vec<Arc<Subscription>> = conn.subs.read().await.values().cloned().collect();
    let routes = server.route_list().await;
    for sub in subs {
        if let Some(account) = server.accounts.get(&sub.account).await {
            let edge = account.unsubscribe(&sub.subject, sub.queue.as_ref(), &sub.id, conn.id).await;
            if let Some(edge) = edge {
                server.interest.broadcast_edge(&routes, &sub.account, &sub.subject.as_string(), sub.queue.as_ref(), edge).await;
            }
        }
    }

    if let Some(account) = conn.account.read().await.clone() {
        account.unregister_client(conn.id).await;
    }
    info!("client {:?} disconnected", conn.id);
}

//! C3/C4 — shared connection state: the per-peer state machine, pending-out
//! buffer and subscription tables common to both client and route links.
//!
//! A `Connection` owns exactly two logical fibers (spec.md §5): the read
//! loop that owns `subs`/`rsid_to_sub` outright, and the write loop that
//! only ever touches `pending_out` and `closed` — both accessed through
//! channels/atomics so the two never need to share a lock.

pub mod client;
pub mod route;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};

use crate::account::Account;
use crate::error::ProtocolError;
use crate::protocol::encode_err;
use crate::subscription::{ConnectionId, Subscription, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Client,
    Route,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Init = 0,
    AwaitConnect = 1,
    Active = 2,
    Draining = 3,
    Closed = 4,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Init,
            1 => State::AwaitConnect,
            2 => State::Active,
            3 => State::Draining,
            _ => State::Closed,
        }
    }
}

/// A remote subscription's local stand-in on a route connection: a
/// synthetic `Subscription` that, when matched, is forwarded back out as
/// an `RMSG` rather than delivered to a socket.
pub struct RemoteSub {
    pub account: Arc<Account>,
    pub sub: Arc<Subscription>,
}

/// Shared state for one TCP peer, client or route.
pub struct Connection {
    pub id: ConnectionId,
    pub kind: Kind,
    pub peer_addr: SocketAddr,
    state: AtomicU8,
    /// Bounded channel standing in for the pending-out buffer: the write
    /// loop drains it to the socket, the read loop (or any other task that
    /// wants to deliver to this peer) pushes onto it with `try_send` so a
    /// slow consumer never blocks a publisher.
    pub out_tx: mpsc::Sender<Bytes>,
    pending_bytes: AtomicUsize,
    pub max_pending_bytes: usize,
    pub closed: AtomicBool,
    pub subs: RwLock<HashMap<SubscriptionId, Arc<Subscription>>>,
    /// Route-only: remote sid -> synthetic local subscription.
    pub rsid_to_sub: RwLock<HashMap<Bytes, RemoteSub>>,
    /// Route-only: set once the INFO exchange completes successfully.
    pub cluster_name: RwLock<Option<String>>,
    /// Client-only: the account this connection's CONNECT bound it to.
    pub account: RwLock<Option<Arc<Account>>>,
    /// Count of `PING`s sent since the last `PONG`; the ping task closes the
    /// connection once this exceeds the configured `ping_max` (spec.md §6
    /// "stale connection detection").
    pub unanswered_pings: AtomicUsize,
}

impl Connection {
    pub fn new(id: ConnectionId, kind: Kind, peer_addr: SocketAddr, out_tx: mpsc::Sender<Bytes>, max_pending_bytes: usize) -> Arc<Connection> {
        Arc::new(Connection {
            id,
            kind,
            peer_addr,
            state: AtomicU8::new(State::Init as u8),
            out_tx,
            pending_bytes: AtomicUsize::new(0),
            max_pending_bytes,
            closed: AtomicBool::new(false),
            subs: RwLock::new(HashMap::new()),
            rsid_to_sub: RwLock::new(HashMap::new()),
            cluster_name: RwLock::new(None),
            account: RwLock::new(None),
            unanswered_pings: AtomicUsize::new(0),
        })
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, s: State) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enqueues a frame for the write loop. Returns `Err` (and marks the
    /// connection a slow consumer) if this would exceed the pending-out
    /// byte cap. Never blocks: the publisher side calls this directly.
    pub fn enqueue(&self, frame: Bytes) -> Result<(), SlowConsumer> {
        if self.is_closed() {
            return Ok(());
        }
        let len = frame.len();
        let now = self.pending_bytes.fetch_add(len, Ordering::SeqCst) + len;
        if now > self.max_pending_bytes {
            self.fail_slow_consumer();
            return Err(SlowConsumer);
        }
        match self.out_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.fail_slow_consumer();
                Err(SlowConsumer)
            }
        }
    }

    /// Pushes a `-ERR Slow Consumer` directly onto the channel, bypassing
    /// `enqueue`'s own closed-check (which would otherwise see the
    /// connection already closed and silently drop it), then marks the
    /// connection closed. Best-effort: a full or gone channel just drops it.
    fn fail_slow_consumer(&self) {
        let _ = self.out_tx.try_send(encode_err(&ProtocolError::SlowConsumer.reason()));
        self.mark_closed();
    }

    /// Called by the write loop after actually flushing `len` bytes, to
    /// keep the backpressure accounting honest.
    pub fn account_for_flushed(&self, len: usize) {
        self.pending_bytes.fetch_sub(len, Ordering::SeqCst);
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.set_state(State::Closed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlowConsumer;

/// Sends `err`'s exact wire reason as a `-ERR` and reports whether the
/// connection should stay open afterward, mirroring `ProtocolError::is_fatal`.
/// Shared by the client and route dispatch loops so both render the same
/// closed set of reason strings instead of ad-hoc text.
pub fn send_protocol_error(conn: &Connection, err: ProtocolError) -> bool {
    let _ = conn.enqueue(encode_err(&err.reason()));
    !err.is_fatal()
}

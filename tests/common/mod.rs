//! Shared scaffolding for the integration tests in this directory: spins up
//! a real `ServerShared` behind a loopback `TcpListener` and drives it with
//! plain `TcpStream`s speaking the wire protocol, the same way a real
//! client or route would.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nervecore::connection::{client, route};
use nervecore::limits::Limits;
use nervecore::protocol::{Decoder, Op};
use nervecore::server::ServerShared;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Limits tuned for fast, deterministic tests: the ping interval is pushed
/// out far past any test's runtime so liveness pings never interleave with
/// the frames a test is asserting on.
pub fn test_limits() -> Limits {
    Limits { ping_interval: Duration::from_secs(3600), ..Limits::default() }
}

/// Boots a server and its client listener, returns the shared handle and
/// the address clients should dial.
pub async fn spawn_server(name: &str, cluster_name: &str) -> (Arc<ServerShared>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ServerShared::new(
        format!("{}-id", name),
        name.to_string(),
        addr.ip().to_string(),
        addr.port(),
        cluster_name.to_string(),
        test_limits(),
    );
    let accept_server = server.clone();
    tokio::spawn(async move {
        let mut listener = listener;
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let server = accept_server.clone();
            tokio::spawn(async move {
                client::handle(server, socket, peer).await;
            });
        }
    });
    (server, addr)
}

/// Adds a route listener on top of an already-running server.
pub async fn spawn_route_listener(server: &Arc<ServerShared>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let route_server = server.clone();
    tokio::spawn(async move {
        let mut listener = listener;
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let server = route_server.clone();
            tokio::spawn(async move {
                route::handle(server, socket, peer).await;
            });
        }
    });
    addr
}

/// Dials one route connection from `server` to `addr`, once (no reconnect
/// loop — tests control timing explicitly rather than via `cluster::dial_route`).
pub async fn dial_route_once(server: Arc<ServerShared>, addr: SocketAddr) {
    let socket = TcpStream::connect(addr).await.unwrap();
    let peer = socket.peer_addr().unwrap();
    tokio::spawn(async move {
        route::handle(server, socket, peer).await;
    });
}

/// A bare client socket that speaks the wire protocol by hand.
pub struct TestClient {
    stream: TcpStream,
    decoder: Decoder,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> TestClient {
        let stream = TcpStream::connect(addr).await.unwrap();
        TestClient { stream, decoder: Decoder::new() }
    }

    async fn send(&mut self, line: &str) {
        self.stream.write_all(line.as_bytes()).await.unwrap();
    }

    /// Sends `CONNECT` for the default global account and waits out the
    /// server's greeting `INFO`.
    pub async fn connect_handshake(&mut self) {
        assert!(matches!(self.next_op().await, Op::Info(_)));
        self.send("CONNECT {\"protocol\":1,\"verbose\":false}\r\n").await;
    }

    pub async fn sub(&mut self, subject: &str, queue: Option<&str>, sid: &str) {
        match queue {
            Some(q) => self.send(&format!("SUB {} {} {}\r\n", subject, q, sid)).await,
            None => self.send(&format!("SUB {} {}\r\n", subject, sid)).await,
        }
    }

    pub async fn unsub(&mut self, sid: &str, max: Option<u64>) {
        match max {
            Some(m) => self.send(&format!("UNSUB {} {}\r\n", sid, m)).await,
            None => self.send(&format!("UNSUB {}\r\n", sid)).await,
        }
    }

    pub async fn publish(&mut self, subject: &str, payload: &[u8]) {
        self.send(&format!("PUB {} {}\r\n", subject, payload.len())).await;
        self.stream.write_all(payload).await.unwrap();
        self.stream.write_all(b"\r\n").await.unwrap();
    }

    pub async fn next_op(&mut self) -> Op {
        loop {
            if let Some(op) = self.decoder.next_op().expect("decode error") {
                return op;
            }
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await.expect("read error");
            assert!(n > 0, "connection closed while waiting for a frame");
            self.decoder.feed(&buf[..n]);
        }
    }

    /// Reads ops, skipping `INFO`/`PING`, until the next `MSG`.
    pub async fn next_msg(&mut self) -> (String, Bytes) {
        loop {
            match self.next_op().await {
                Op::Msg { subject, payload, .. } => return (subject, payload),
                Op::Info(_) | Op::Ping => continue,
                other => panic!("unexpected op while waiting for MSG: {:?}", other),
            }
        }
    }

    /// True if the peer closed the connection (read returns EOF) within `within`.
    pub async fn closed_within(&mut self, within: Duration) -> bool {
        let mut buf = [0u8; 64];
        match tokio::time::timeout(within, self.stream.read(&mut buf)).await {
            Ok(Ok(0)) => true,
            _ => false,
        }
    }
}

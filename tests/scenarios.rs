//! End-to-end exercises of the concrete scenarios this core's behavior is
//! specified against: cluster coalescing, auto-unsubscribe propagation,
//! cluster-name mismatch rejection, and lame-duck eviction. Each drives a
//! real `ServerShared` over loopback TCP rather than calling internals
//! directly, so the wire protocol, the matcher, and the route fanout are
//! all exercised together.

mod common;

use std::time::Duration;

use common::{dial_route_once, spawn_route_listener, spawn_server, TestClient};
use nervecore::protocol::Op;
use tokio::time::{delay_for, timeout};

/// Scenario 1 — cluster coalescing. Three queue subscribers on A, one
/// publisher on B; B should see its interest coalesced into a single
/// synthetic subscription, and exactly one of A's three subscribers
/// should receive the message.
#[tokio::test]
async fn cluster_coalescing_delivers_to_exactly_one_queue_member() {
    let (server_a, addr_a) = spawn_server("a", "cluster1").await;
    let (server_b, addr_b) = spawn_server("b", "cluster1").await;
    let route_addr_b = spawn_route_listener(&server_b).await;
    dial_route_once(server_a.clone(), route_addr_b).await;
    delay_for(Duration::from_millis(150)).await;

    let mut subscribers = Vec::new();
    for sid in ["1", "2", "3"] {
        let mut c = TestClient::connect(addr_a).await;
        c.connect_handshake().await;
        c.sub("foo", Some("qg1"), sid).await;
        subscribers.push(c);
    }
    // let the RS+ for the first (0->1) subscription propagate to B.
    delay_for(Duration::from_millis(150)).await;

    let account_a = server_a.accounts.get("$G").await.expect("account exists on A");
    assert_eq!(account_a.num_subscriptions().await, 3);
    let account_b = server_b.accounts.get("$G").await.expect("account exists on B");
    assert_eq!(account_b.num_subscriptions().await, 1, "B should see one coalesced synthetic subscription");

    let mut publisher = TestClient::connect(addr_b).await;
    publisher.connect_handshake().await;
    publisher.publish("foo", b"ok").await;

    let mut delivered = 0;
    for sub in subscribers.iter_mut() {
        if timeout(Duration::from_millis(300), sub.next_msg()).await.is_ok() {
            delivered += 1;
        }
    }
    assert_eq!(delivered, 1, "exactly one queue member should receive the message");
}

/// Scenario 4 — auto-unsubscribe propagation. `UNSUB sid 1` right after a
/// fresh `SUB` means "after the next delivery, drop me"; repeating the
/// cycle must keep delivering and must leave no residual interest behind
/// on a peer across the route once the last cycle settles.
#[tokio::test]
async fn auto_unsubscribe_after_one_delivery_propagates_to_routes() {
    let (server_a, addr_a) = spawn_server("a", "cluster2").await;
    let (server_b, _addr_b) = spawn_server("b", "cluster2").await;
    let route_addr_b = spawn_route_listener(&server_b).await;
    dial_route_once(server_a.clone(), route_addr_b).await;
    delay_for(Duration::from_millis(150)).await;

    let mut client = TestClient::connect(addr_a).await;
    client.connect_handshake().await;

    const ITERATIONS: usize = 20;
    for _ in 0..ITERATIONS {
        client.sub("foo", None, "1").await;
        client.unsub("1", Some(1)).await;
        client.publish("foo", b"ok").await;
        let (subject, payload) = client.next_msg().await;
        assert_eq!(subject, "foo");
        assert_eq!(&payload[..], b"ok");
    }

    delay_for(Duration::from_millis(200)).await;

    let account_a = server_a.accounts.get("$G").await.expect("account exists on A");
    assert_eq!(account_a.num_subscriptions().await, 0, "last auto-unsubscribe should leave no subscription on A");
    let account_b = server_b.accounts.get("$G").await.expect("account exists on B");
    assert_eq!(account_b.num_subscriptions().await, 0, "RS- must have propagated, leaving no residual interest on B");
}

/// Scenario 5 — cluster name mismatch. Two servers with different cluster
/// names must never form a route; the connection that bridges them closes
/// right after the `INFO` exchange.
#[tokio::test]
async fn mismatched_cluster_names_refuse_to_form_a_route() {
    let (server_1, _addr_1) = spawn_server("s1", "MyCluster33").await;
    let route_addr_1 = spawn_route_listener(&server_1).await;
    let (server_2, _addr_2) = spawn_server("s2", "MyCluster22").await;

    dial_route_once(server_2.clone(), route_addr_1).await;
    delay_for(Duration::from_millis(300)).await;

    assert_eq!(server_1.routes.read().await.len(), 0, "no route should remain on S1");
    assert_eq!(server_2.routes.read().await.len(), 0, "no route should remain on S2");
}

/// Scenario 6 — lame-duck eviction. Entering lame-duck with a non-zero
/// drain duration must spread client eviction across that duration (not
/// evict everyone instantly) and leave zero clients connected afterward.
#[tokio::test]
async fn lame_duck_evicts_all_clients_over_the_configured_duration() {
    let (server, addr) = spawn_server("a", "").await;

    let mut clients = Vec::new();
    for _ in 0..5 {
        let mut c = TestClient::connect(addr).await;
        c.connect_handshake().await;
        clients.push(c);
    }
    delay_for(Duration::from_millis(100)).await;
    assert_eq!(server.clients.read().await.len(), 5);

    let drain = Duration::from_millis(100);
    let start = std::time::Instant::now();
    server.enter_lame_duck(Duration::from_millis(0), drain).await.unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= drain, "eviction must be spread across the full drain duration, took {:?}", elapsed);
    assert_eq!(server.clients.read().await.len(), 0);

    for c in clients.iter_mut() {
        assert!(c.closed_within(Duration::from_millis(500)).await, "every evicted client socket should observe a close");
    }
}

/// Scenario 6 (continued) — inbound clients must be refused outright once
/// lame duck has started, not just drained along with everyone else.
#[tokio::test]
async fn lame_duck_rejects_new_inbound_clients() {
    let (server, addr) = spawn_server("a", "").await;
    server.enter_lame_duck(Duration::from_millis(0), Duration::from_millis(10)).await.unwrap();

    let mut c = TestClient::connect(addr).await;
    assert!(matches!(c.next_op().await, Op::Err(_)), "should be greeted with -ERR instead of the normal INFO handshake");
    assert!(c.closed_within(Duration::from_millis(500)).await, "and then the connection should close");
}

/// Lame-duck with a grace period must not evict anyone before the grace
/// elapses.
#[tokio::test]
async fn lame_duck_grace_period_delays_eviction() {
    let (server, addr) = spawn_server("a", "").await;
    let mut client = TestClient::connect(addr).await;
    client.connect_handshake().await;
    delay_for(Duration::from_millis(50)).await;

    let server_for_ldm = server.clone();
    let grace = Duration::from_millis(200);
    let drain = Duration::from_millis(300);
    tokio::spawn(async move {
        server_for_ldm.enter_lame_duck(grace, drain).await.unwrap();
    });

    delay_for(Duration::from_millis(100)).await;
    assert_eq!(server.clients.read().await.len(), 1, "nobody should be evicted before the grace period elapses");
}

//! C6 — Cluster Manager: accepts inbound route connections, dials the
//! configured outbound routes, and keeps reconnecting on failure with
//! backoff (spec.md §4.6, §9).

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::delay_for;

use crate::connection::route;
use crate::server::ServerShared;

/// Accepts inbound route connections for the lifetime of the server.
pub async fn run_route_listener(server: Arc<ServerShared>, addr: std::net::SocketAddr) -> std::io::Result<()> {
    let mut listener = TcpListener::bind(addr).await?;
    info!("route listener bound on {}", addr);
    loop {
        if server.is_stopping() {
            return Ok(());
        }
        let (socket, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("route accept error: {}", e);
                continue;
            }
        };
        let server = server.clone();
        tokio::spawn(async move {
            route::handle(server, socket, peer_addr).await;
        });
    }
}

/// Dials one configured peer and keeps reconnecting for as long as the
/// server runs. Backoff doubles each failed attempt up to a 30s cap.
/// Reported at attempt 1 and every third attempt thereafter so a flapping
/// peer doesn't flood the log.
pub async fn dial_route(server: Arc<ServerShared>, url: String) {
    let mut attempt: u64 = 0;
    loop {
        if server.is_stopping() {
            return;
        }
        attempt += 1;
        match TcpStream::connect(&url).await {
            Ok(socket) => {
                attempt = 0;
                let peer_addr = socket.peer_addr().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
                info!("connected to route {}", url);
                route::handle(server.clone(), socket, peer_addr).await;
                info!("route {} disconnected, will redial", url);
            }
            Err(e) => {
                if should_report(attempt) {
                    error!("dial to route {} failed (attempt {}): {}", url, attempt, e);
                }
            }
        }
        if server.is_stopping() {
            return;
        }
        delay_for(backoff(attempt)).await;
    }
}

fn should_report(attempt: u64) -> bool {
    attempt == 1 || attempt % 3 == 0
}

fn backoff(attempt: u64) -> Duration {
    let secs = 1u64.checked_shl(attempt.min(5) as u32).unwrap_or(30).min(30);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reports_first_and_every_third_attempt() {
        let reported: Vec<u64> = (1..=10).filter(|a| should_report(*a)).collect();
        assert_eq!(reported, vec![1, 3, 6, 9]);
    }

    #[test]
    fn backoff_is_capped_at_thirty_seconds() {
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(10), Duration::from_secs(30));
    }
}

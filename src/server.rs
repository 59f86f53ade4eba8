//! C7 — Server Core: owns accounts, the connection table, shutdown
//! orchestration and the lame-duck scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tokio::time::delay_for;

use crate::account::Registry as AccountRegistry;
use crate::connection::{Connection, Kind, State};
use crate::error::ConfigError;
use crate::info::ServerInfo;
use crate::interest::InterestPropagator;
use crate::limits::Limits;
use crate::protocol::encode_info;
use crate::subscription::ConnectionId;

/// Process-wide, shared by every client and route connection's handler.
pub struct ServerShared {
    pub server_id: String,
    pub server_name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub cluster_name: RwLock<String>,
    pub accounts: AccountRegistry,
    pub interest: InterestPropagator,
    pub routes: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    pub clients: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    pub limits: Limits,
    next_conn_id: AtomicU64,
    pub lame_duck: AtomicBool,
    pub stopping: AtomicBool,
    pub connect_urls: RwLock<Vec<String>>,
}

impl ServerShared {
    pub fn new(server_id: String, server_name: String, host: String, port: u16, cluster_name: String, limits: Limits) -> Arc<ServerShared> {
        Arc::new(ServerShared {
            server_id,
            server_name,
            version: env!("CARGO_PKG_VERSION").to_string(),
            host: host.clone(),
            port,
            cluster_name: RwLock::new(cluster_name),
            accounts: AccountRegistry::new(Duration::from_secs(60)),
            interest: InterestPropagator::new(),
            routes: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            limits,
            next_conn_id: AtomicU64::new(1),
            lame_duck: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            connect_urls: RwLock::new(vec![format!("{}:{}", host, port)]),
        })
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_conn_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn is_lame_duck(&self) -> bool {
        self.lame_duck.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub async fn server_info(&self) -> ServerInfo {
        ServerInfo {
            server_id: self.server_id.clone(),
            server_name: self.server_name.clone(),
            version: self.version.clone(),
            host: self.host.clone(),
            port: self.port,
            cluster: self.cluster_name.read().await.clone(),
            connect_urls: self.connect_urls.read().await.clone(),
            lame_duck_mode: self.is_lame_duck(),
            route_id: None,
        }
    }

    pub async fn route_list(&self) -> Vec<Arc<Connection>> {
        self.routes.read().await.values().cloned().collect()
    }

    pub async fn account_names(&self) -> Vec<String> {
        self.accounts.names().await
    }

    /// Pushes a fresh `INFO` to every connected client. Called whenever
    /// topology changes (route join/leave, lame-duck entry) — spec.md §9
    /// "Discovery of peer URLs". Each client connection serializes this
    /// alongside its own outgoing `MSG` frames through the same
    /// `enqueue`, so an `INFO` can never interleave mid-frame.
    pub async fn broadcast_info_to_clients(&self) {
        let info = self.server_info().await;
        let frame = encode_info(&info);
        for client in self.clients.read().await.values() {
            let _ = client.enqueue(frame.clone());
        }
    }

    /// Enters lame-duck mode: advertises `lame_duck_mode: true` and drops
    /// our own URL from the advertised connect set so clients migrate
    /// elsewhere, waits `grace`, then evicts all current clients spread
    /// evenly over `duration`. Routes are untouched throughout.
    pub async fn enter_lame_duck(self: &Arc<Self>, grace: Duration, duration: Duration) -> Result<(), ConfigError> {
        if grace >= duration {
            return Err(ConfigError::LameDuckGraceNotLessThanDuration { grace, duration });
        }

        self.lame_duck.store(true, Ordering::SeqCst);
        {
            let mut urls = self.connect_urls.write().await;
            urls.retain(|u| u != &format!("{}:{}", self.host, self.port));
        }
        self.broadcast_info_to_clients().await;

        if !grace.is_zero() {
            delay_for(grace).await;
        }

        self.drain_clients(duration).await;
        Ok(())
    }

    /// Evicts every currently-connected client, spread evenly over
    /// `duration` so the peer isn't hit with a reconnection storm.
    async fn drain_clients(&self, duration: Duration) {
        let mut ids: Vec<ConnectionId> = self.clients.read().await.keys().cloned().collect();
        ids.shuffle(&mut rand::thread_rng());
        if ids.is_empty() {
            return;
        }

        let interval = duration / ids.len() as u32;
        for id in ids {
            if let Some(conn) = self.clients.write().await.remove(&id) {
                conn.set_state(State::Draining);
                conn.mark_closed();
            }
            if !interval.is_zero() {
                delay_for(interval).await;
            }
        }
    }

    /// Signals every read loop to stop at its next observation point and
    /// gives the write loops a bounded deadline to flush.
    pub fn begin_shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub async fn register_connection(&self, conn: Arc<Connection>) {
        match conn.kind {
            Kind::Client => {
                self.clients.write().await.insert(conn.id, conn);
            }
            Kind::Route => {
                self.routes.write().await.insert(conn.id, conn);
            }
        }
    }

    pub async fn remove_connection(&self, id: ConnectionId, kind: Kind) -> Option<Arc<Connection>> {
        match kind {
            Kind::Client => self.clients.write().await.remove(&id),
            Kind::Route => self.routes.write().await.remove(&id),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn lame_duck_rejects_grace_not_less_than_duration() {
        let server = ServerShared::new("id1".into(), "name1".into(), "127.0.0.1".into(), 4222, "".into(), Limits::default());
        let err = server.enter_lame_duck(Duration::from_secs(10), Duration::from_secs(10)).await;
        assert!(matches!(err, Err(ConfigError::LameDuckGraceNotLessThanDuration { .. })));
    }

    #[tokio::test]
    async fn lame_duck_removes_own_url_and_sets_flag() {
        let server = ServerShared::new("id1".into(), "name1".into(), "127.0.0.1".into(), 4222, "".into(), Limits::default());
        server.enter_lame_duck(Duration::from_millis(0), Duration::from_millis(5)).await.unwrap();
        assert!(server.is_lame_duck());
        assert!(server.connect_urls.read().await.is_empty());
    }
}

//! The `nervecored` binary: parses flags, validates configuration, starts
//! the listeners, and runs until shutdown.

use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nanoid::nanoid;
use nervecore::cluster;
use nervecore::config::Cli;
use nervecore::connection::client;
use nervecore::error::ServerError;
use nervecore::server::ServerShared;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let cli: Cli = argh::from_env();
    match run(cli).await {
        Ok(()) => exit(0),
        Err(e) => {
            log::error!("{}", e);
            exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> Result<(), ServerError> {
    let settings = cli.resolve()?;

    let (host, port) = split_addr(&settings.addr)?;
    let server_id = nanoid!();
    let server = ServerShared::new(server_id, settings.server_name.clone(), host, port, settings.cluster_name.clone(), settings.limits.clone());

    let stopping = Arc::new(AtomicBool::new(false));
    {
        let stopping = stopping.clone();
        ctrlc::set_handler(move || {
            stopping.store(true, Ordering::SeqCst);
        })
        .map_err(|e| ServerError::Runtime(format!("failed to install signal handler: {}", e)))?;
    }

    let client_addr = settings.addr.parse().map_err(|_| ServerError::Runtime(format!("invalid client address {}", settings.addr)))?;
    let client_server = server.clone();
    tokio::spawn(async move {
        if let Err(e) = run_client_listener(client_server, client_addr).await {
            log::error!("client listener stopped: {}", e);
        }
    });

    if let Some(cluster_addr) = &settings.cluster_addr {
        let cluster_addr: std::net::SocketAddr =
            cluster_addr.parse().map_err(|_| ServerError::Runtime(format!("invalid cluster address {}", cluster_addr)))?;
        let route_server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = cluster::run_route_listener(route_server, cluster_addr).await {
                log::error!("route listener stopped: {}", e);
            }
        });
    }

    for url in &settings.route_urls {
        let server = server.clone();
        let url = url.clone();
        tokio::spawn(async move {
            cluster::dial_route(server, url).await;
        });
    }

    log::info!("nervecored listening on {}", settings.addr);

    loop {
        tokio::time::delay_for(std::time::Duration::from_millis(200)).await;
        if stopping.load(Ordering::SeqCst) {
            break;
        }
    }

    if settings.lame_duck_on_shutdown {
        log::info!("entering lame-duck mode before shutdown");
        server.enter_lame_duck(settings.lame_duck_grace, settings.lame_duck_duration).await?;
    }
    server.begin_shutdown();

    Ok(())
}

async fn run_client_listener(server: Arc<ServerShared>, addr: std::net::SocketAddr) -> std::io::Result<()> {
    let mut listener = TcpListener::bind(addr).await?;
    loop {
        if server.is_stopping() {
            return Ok(());
        }
        let (socket, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("client accept error: {}", e);
                continue;
            }
        };
        let server = server.clone();
        tokio::spawn(async move {
            client::handle(server, socket, peer_addr).await;
        });
    }
}

fn split_addr(addr: &str) -> Result<(String, u16), ServerError> {
    let parsed: std::net::SocketAddr = addr.parse().map_err(|_| ServerError::Runtime(format!("invalid address {}", addr)))?;
    Ok((parsed.ip().to_string(), parsed.port()))
}

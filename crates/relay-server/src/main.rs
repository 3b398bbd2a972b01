//! Standalone relay binary (SPEC_FULL.md §2.2): a bare authenticated-by-
//! construction TCP fan-out service for the Socket transport variant. It
//! pairs two PROXY_WHO handshakes sharing a `request_id` and then forwards
//! frames byte-for-byte between them until one side disconnects. It is not
//! the signaling service: no users, no requests, no push events.
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;

mod relay;

use relay::RelayState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_server=info".into()),
        )
        .init();

    let host = std::env::var("RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("RELAY_PORT")
        .unwrap_or_else(|_| "7711".into())
        .parse()?;
    let pairing_timeout_secs: u64 = std::env::var("RELAY_PAIRING_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);

    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(socket.into())?;

    info!("relay listening on {addr}, pairing timeout {pairing_timeout_secs}s");

    let state = RelayState::new(Duration::from_secs(pairing_timeout_secs));

    tokio::select! {
        _ = accept_loop(listener, state) => {}
        _ = shutdown_signal() => {
            info!("relay shutting down");
        }
    }

    Ok(())
}

async fn accept_loop(listener: tokio::net::TcpListener, state: std::sync::Arc<RelayState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                info!("relay: accepted connection from {peer_addr}");
                let state = std::sync::Arc::clone(&state);
                tokio::spawn(state.handle_connection(stream));
            }
            Err(e) => {
                tracing::error!("relay: accept error: {e}");
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received Ctrl+C"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received Ctrl+C");
    }
}

//! TCP listeners and per-connection proxy sessions
//!
//! One listener per published port. Each accepted connection becomes its own
//! task: acquire a backend, relay bytes both ways, release the backend. A
//! slow or failing container start only ever stalls its own session.

use crate::manager::InstanceManager;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Listening socket for one published port
pub struct ProxyListener {
    bind_addr: SocketAddr,
    manager: Arc<InstanceManager>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyListener {
    pub fn new(
        bind_addr: SocketAddr,
        manager: Arc<InstanceManager>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            manager,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let external_port = self.bind_addr.port();
        info!(addr = %self.bind_addr, "Listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let manager = Arc::clone(&self.manager);
                            tokio::spawn(async move {
                                handle_connection(stream, peer, external_port, manager).await;
                            });
                        }
                        Err(e) => {
                            error!(port = external_port, error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(port = external_port, "Listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// One proxy session, from accept to teardown.
///
/// The client socket is not read until a backend is attached; untrusted bytes
/// sit in the kernel buffer until the relay starts. `release` runs exactly
/// once on every path past a successful acquire.
async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    external_port: u16,
    manager: Arc<InstanceManager>,
) {
    debug!(%peer, port = external_port, "Connection accepted");

    let instance = match manager.acquire(external_port).await {
        Ok(instance) => instance,
        Err(e) => {
            warn!(%peer, port = external_port, error = %e, "Rejecting connection");
            let _ = client.write_all(e.client_message().as_bytes()).await;
            let _ = client.shutdown().await;
            return;
        }
    };

    match instance.host_port() {
        Some(host_port) => {
            if let Err(e) = relay(client, peer, host_port).await {
                debug!(%peer, host_port, error = %e, "Relay ended with error");
            }
        }
        None => {
            error!(%peer, image = %instance.image(), "Acquired instance has no host port");
        }
    }

    manager.release(instance).await;
    debug!(%peer, port = external_port, "Session closed");
}

/// Bridge the client with the backend until either side closes or errors
async fn relay(mut client: TcpStream, peer: SocketAddr, host_port: u16) -> anyhow::Result<()> {
    let mut backend = TcpStream::connect(("127.0.0.1", host_port))
        .await
        .map_err(|e| {
            anyhow::anyhow!("Failed to connect to backend on port {}: {}", host_port, e)
        })?;

    let (client_to_backend, backend_to_client) =
        tokio::io::copy_bidirectional(&mut client, &mut backend).await?;

    debug!(
        %peer,
        host_port,
        client_to_backend,
        backend_to_client,
        "Connection closed normally"
    );
    Ok(())
}

//! Hub TCP server.
//!
//! Accepts agent and admin connections and runs one frame loop per
//! connection against the shared [`Router`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warden_protocol::constants::DEFAULT_TCP_PORT;
use warden_transport::split_stream;

use crate::HubError;
use crate::router::{ConnState, Router};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (port 0 = OS-assigned).
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: ([0, 0, 0, 0], DEFAULT_TCP_PORT).into(),
        }
    }
}

/// The hub's TCP server.
pub struct HubServer {
    router: Arc<Router>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl HubServer {
    /// Binds the listening socket.
    pub async fn bind(config: ServerConfig, router: Arc<Router>) -> Result<Arc<Self>, HubError> {
        let listener = TcpListener::bind(config.listen).await?;
        let local_addr = listener.local_addr()?;
        info!("hub listening on {local_addr}");
        Ok(Arc::new(Self {
            router,
            listener: Mutex::new(Some(listener)),
            local_addr,
            cancel: CancellationToken::new(),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Gracefully shuts down the server and every open connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the accept loop until [`shutdown`](Self::shutdown).
    ///
    /// Also runs the idle-session reaper for the lifetime of the server.
    pub async fn run(self: &Arc<Self>) -> Result<(), HubError> {
        let Some(listener) = self.listener.lock().await.take() else {
            warn!("hub server already running");
            return Ok(());
        };
        let reaper = self.router.sessions().spawn_reaper(self.cancel.child_token());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("hub server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let router = Arc::clone(&self.router);
                            let cancel = self.cancel.child_token();
                            tokio::spawn(async move {
                                serve_connection(router, stream, peer_addr, cancel).await;
                            });
                        }
                        Err(e) => {
                            error!("accept error: {e}");
                        }
                    }
                }
            }
        }

        let _ = reaper.await;
        Ok(())
    }
}

/// Reads frames until the peer hangs up, a frame is malformed, or the
/// server shuts down, then releases everything the connection held.
async fn serve_connection(
    router: Arc<Router>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    cancel: CancellationToken,
) {
    let (conn, mut reader) = split_stream(stream);
    let mut state = ConnState::new(Arc::clone(&conn));
    info!(%peer_addr, conn = %conn.id(), "connection accepted");

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = reader.recv() => frame,
        };
        match frame {
            Ok(Some(frame)) => {
                if let Err(e) = router.handle_frame(&mut state, frame).await {
                    debug!(%peer_addr, "write failed, dropping connection: {e}");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(%peer_addr, "dropping connection: {e}");
                break;
            }
        }
    }

    router.on_disconnect(&mut state).await;
    conn.shutdown().await;
}

//! Listener: the TCP accept loop.
//!
//! Grounded on `socket::server::SocketServer::start`/`accept_loop`: bind,
//! then spawn one task per accepted stream running the Connection
//! Lifecycle, with the listener itself holding no per-session state.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info};
use tokio::net::TcpListener;

use crate::connection;
use crate::history::History;
use crate::registry::Registry;

/// Bind `addr` and run the accept loop until the process is killed. Only
/// a bind failure is fatal; per-connection errors are contained within
/// their own task.
pub async fn run(addr: &str, registry: Arc<Registry>, history: Arc<History>) -> Result<()> {
    let listener = TcpListener::bind(addr).await.with_context(|| format!("binding listener on {addr}"))?;
    info!("listening on {addr}");
    serve(listener, registry, history).await
}

/// Drive the accept loop over an already-bound listener. Split out from
/// [`run`] so tests can bind to an ephemeral port (`127.0.0.1:0`), read
/// back the assigned address, and only then start serving.
pub async fn serve(listener: TcpListener, registry: Arc<Registry>, history: Arc<History>) -> Result<()> {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!("accept failed: {err:#}");
                continue;
            }
        };
        let registry = Arc::clone(&registry);
        let history = Arc::clone(&history);
        tokio::spawn(async move {
            connection::handle(stream, peer_addr, registry, history).await;
        });
    }
}

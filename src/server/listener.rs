use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::http::connection::Connection;
use crate::proxy::ProxyHandler;

/// Bind the proxy port on `addr` and serve clients until accepting fails.
pub async fn run(addr: &str, handler: ProxyHandler) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("couldn't listen on http proxy port {addr}"))?;
    info!(addr = %listener.local_addr()?, "listening on http proxy port");

    serve(listener, handler).await
}

/// Accept loop over an already bound listener.
pub async fn serve(listener: TcpListener, handler: ProxyHandler) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        debug!(%peer, "accepted connection");

        let handler = handler.clone();
        tokio::spawn(async move {
            let mut conn = Connection::new(socket, peer, handler);
            if let Err(e) = conn.run().await {
                error!(%peer, error = %e, "connection error");
            }
        });
    }
}

use anyhow::Context;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::ping::heartbeat::{Heartbeat, MAX_DATAGRAM_SIZE};
use crate::route::RouteRegistry;

/// Bind the heartbeat socket on `addr` and feed `registry` until the socket
/// fails.
pub async fn run(addr: &str, registry: RouteRegistry) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("couldn't listen on udp ping port {addr}"))?;
    info!(addr = %socket.local_addr()?, "listening on udp ping port");

    serve(socket, registry).await
}

/// Heartbeat loop over an already bound socket.
///
/// Malformed payloads are logged and dropped. A read error ends the loop,
/// since a proxy that can no longer hear heartbeats must not keep routing.
/// Senders never get a reply.
pub async fn serve(socket: UdpSocket, registry: RouteRegistry) -> anyhow::Result<()> {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (n, peer) = socket
            .recv_from(&mut buf)
            .await
            .context("error reading from udp ping port")?;

        match Heartbeat::decode(&buf[..n]) {
            Ok(heartbeat) => {
                debug!(
                    prefix = %heartbeat.prefix,
                    port = heartbeat.port,
                    secure = heartbeat.secure,
                    %peer,
                    "heartbeat received"
                );
                registry.record(heartbeat.into_route(peer.ip())).await;
            }
            Err(e) => {
                warn!(%peer, error = %e, "could not decode heartbeat");
            }
        }
    }
}

//! WebSocket bridging
//!
//! An upgrade request cannot go through the plain forwarder, which closes the
//! backend after one response. Instead the bridge replays the handshake on a
//! second connection to the backend and, once the backend agrees to switch
//! protocols, pipes raw bytes both ways without looking at frames.
//!
//! While piping, a single idle deadline covers both directions: the bridge
//! is torn down only once no bytes have moved either way for the idle
//! timeout.
//!
//! ```text
//! Handshaking ──101──▶ Piping ──either side ends / idle──▶ Closed
//!      │
//!      └── dial error / non-101 ──▶ 500 to client, Closed
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::http::request::Request;
use crate::http::response::{Response, ResponseHead};
use crate::http::writer::{serialize_request_head, serialize_response_head, ResponseWriter};
use crate::proxy::dispatch::Dispatch;
use crate::proxy::upstream::{
    read_response_head, BackendStream, Upstream, UpstreamError, BUFFER_SIZE,
};

#[derive(Clone)]
pub struct WebSocketBridge {
    upstream: Upstream,
    idle_timeout: Duration,
}

impl WebSocketBridge {
    pub fn new(upstream: Upstream, idle_timeout: Duration) -> Self {
        Self {
            upstream,
            idle_timeout,
        }
    }

    /// Bridge an upgrade `request` from `client` to the dispatched backend.
    ///
    /// `client_pending` holds bytes the client sent after the handshake that
    /// were already read off its socket; they are delivered to the backend
    /// before piping starts.
    pub async fn bridge<C>(
        &self,
        client: &mut C,
        client_pending: &[u8],
        request: &Request,
        dispatch: &Dispatch,
    ) -> anyhow::Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut backend, head, backend_pending) = match self.handshake(request, dispatch).await {
            Ok(parts) => parts,
            Err(e) => {
                warn!(
                    fwd_addr = %dispatch.fwd_addr,
                    target = %dispatch.target,
                    error = %e,
                    "websocket dial failed"
                );
                return ResponseWriter::new(&Response::internal_error(&e), false)
                    .write_to_stream(client)
                    .await;
            }
        };

        let relayed = timeout(self.idle_timeout, async {
            client.write_all(&serialize_response_head(&head)).await?;
            client.write_all(&backend_pending).await?;
            client.flush().await?;
            backend.write_all(client_pending).await
        })
        .await;
        match relayed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(fwd_addr = %dispatch.fwd_addr, error = %e, "websocket handshake relay failed");
                return Ok(());
            }
            Err(_) => {
                debug!(fwd_addr = %dispatch.fwd_addr, "client stalled during websocket handshake");
                return Ok(());
            }
        }

        debug!(fwd_addr = %dispatch.fwd_addr, target = %dispatch.target, "websocket piping");

        let (client_rd, client_wr) = tokio::io::split(client);
        let (backend_rd, backend_wr) = tokio::io::split(backend);

        let activity = Activity::new();
        let (direction, result) = tokio::select! {
            res = pipe(client_rd, backend_wr, &activity) => ("client->backend", res),
            res = pipe(backend_rd, client_wr, &activity) => ("backend->client", res),
            _ = idle_deadline(&activity, self.idle_timeout) => (
                "both",
                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "websocket went idle")),
            ),
        };

        match result {
            Ok(bytes) => debug!(fwd_addr = %dispatch.fwd_addr, direction, bytes, "websocket closed"),
            Err(e) => debug!(fwd_addr = %dispatch.fwd_addr, direction, error = %e, "websocket closed"),
        }

        Ok(())
    }

    /// Dial the backend and replay the upgrade handshake.
    async fn handshake(
        &self,
        request: &Request,
        dispatch: &Dispatch,
    ) -> Result<(BackendStream, ResponseHead, BytesMut), UpstreamError> {
        let mut backend = self
            .upstream
            .connect(dispatch.fwd_addr, dispatch.route.secure, &dispatch.host)
            .await?;

        let head = serialize_request_head(&request.method, &request.path, &request.headers);
        timeout(self.idle_timeout, async {
            backend.write_all(&head).await?;
            backend.write_all(&request.body).await?;
            backend.flush().await
        })
        .await
        .map_err(|_| UpstreamError::Timeout)??;

        let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
        let response = read_response_head(&mut backend, &mut buffer, self.idle_timeout).await?;

        if response.status != 101 {
            return Err(UpstreamError::Rejected(response.status));
        }

        Ok((backend, response, buffer))
    }
}

/// Last time bytes moved through a bridge, in either direction.
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.start + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// Resolves once `idle` has passed without any [`Activity::touch`].
async fn idle_deadline(activity: &Activity, idle: Duration) {
    loop {
        let deadline = activity.last() + idle;
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}

/// Copy bytes one way until EOF or an error, recording every read and
/// write in `activity`. The writer is shut down on a clean EOF so the peer
/// sees the close.
async fn pipe<R, W>(mut reader: R, mut writer: W, activity: &Activity) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(total);
        }
        activity.touch();

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        activity.touch();
        total += n as u64;
    }
}

//! Plain HTTP forwarding
//!
//! Sends a rewritten request to the backend and streams the response back
//! to the client. The backend is always asked to close the connection after
//! responding, so the response body ends at backend EOF whatever its
//! framing, and it is relayed verbatim.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, warn};

use crate::http::headers::Headers;
use crate::http::request::Request;
use crate::http::response::{Response, ResponseHead};
use crate::http::writer::{serialize_request_head, serialize_response_head, ResponseWriter};
use crate::proxy::dispatch::Dispatch;
use crate::proxy::upstream::{
    read_response_head, BackendStream, Upstream, UpstreamError, BUFFER_SIZE,
};

/// Longest a streamed response chunk may sit in our buffer.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Headers that describe a single hop and never cross the proxy.
const HOP_BY_HOP: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Connection",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "TE",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
];

#[derive(Clone)]
pub struct HttpForwarder {
    upstream: Upstream,
    idle_timeout: Duration,
}

impl HttpForwarder {
    pub fn new(upstream: Upstream, idle_timeout: Duration) -> Self {
        Self {
            upstream,
            idle_timeout,
        }
    }

    /// Forward `request` and stream the backend's answer to `client`.
    ///
    /// Failing to get a response head out of the backend answers the client
    /// with 502 (504 on timeouts). Once the head has been relayed, a broken
    /// stream just ends the exchange.
    pub async fn forward<C>(
        &self,
        client: &mut C,
        request: &Request,
        dispatch: &Dispatch,
    ) -> anyhow::Result<()>
    where
        C: AsyncWrite + Unpin + ?Sized,
    {
        let (head, mut backend, pending) = match self.exchange(request, dispatch).await {
            Ok(parts) => parts,
            Err(e) => {
                warn!(
                    fwd_addr = %dispatch.fwd_addr,
                    target = %dispatch.target,
                    error = %e,
                    "backend request failed"
                );
                let response = if e.is_timeout() {
                    Response::gateway_timeout()
                } else {
                    Response::bad_gateway()
                };
                return ResponseWriter::new(&response, false)
                    .write_to_stream(client)
                    .await;
            }
        };

        let idle = self.idle_timeout;
        let client_head = serialize_response_head(&client_response_head(head.clone()));
        let streamed = async {
            write_all_within(client, &client_head, idle).await?;
            write_all_within(client, &pending, idle).await?;
            copy_with_flush(&mut backend, client, FLUSH_INTERVAL, idle).await
        }
        .await;

        match streamed {
            Ok(bytes) => debug!(
                fwd_addr = %dispatch.fwd_addr,
                status = head.status,
                bytes = bytes + pending.len() as u64,
                "response streamed"
            ),
            Err(e) => debug!(
                fwd_addr = %dispatch.fwd_addr,
                status = head.status,
                error = %e,
                "response stream ended early"
            ),
        }

        Ok(())
    }

    /// Send the request and read the final response head.
    async fn exchange(
        &self,
        request: &Request,
        dispatch: &Dispatch,
    ) -> Result<(ResponseHead, BackendStream, BytesMut), UpstreamError> {
        let mut backend = self
            .upstream
            .connect(dispatch.fwd_addr, dispatch.route.secure, &dispatch.host)
            .await?;

        let head = build_backend_request(request);
        timeout(self.idle_timeout, async {
            backend.write_all(&head).await?;
            backend.write_all(&request.body).await?;
            backend.flush().await
        })
        .await
        .map_err(|_| UpstreamError::Timeout)??;

        let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
        let mut response = read_response_head(&mut backend, &mut buffer, self.idle_timeout).await?;

        // Interim responses (100 Continue, 103 Early Hints) are not relayed.
        while (100..200).contains(&response.status) {
            response = read_response_head(&mut backend, &mut buffer, self.idle_timeout).await?;
        }

        Ok((response, backend, buffer))
    }
}

/// Serialize the request line and headers to send upstream.
///
/// Hop-by-hop headers, including any the client named in `Connection`, are
/// dropped. The body is always sent with an explicit length.
pub fn build_backend_request(request: &Request) -> Vec<u8> {
    let mut headers = strip_hop_by_hop(&request.headers);

    headers.remove("Content-Length");
    headers.remove("Expect");
    if !request.body.is_empty() || request.method.expects_body() {
        headers.set("Content-Length", request.body.len().to_string());
    }
    headers.set("Connection", "close");

    serialize_request_head(&request.method, &request.path, &headers)
}

/// The head relayed to the client: hop-by-hop headers dropped except the
/// body framing, which still describes the bytes we pass through.
fn client_response_head(mut head: ResponseHead) -> ResponseHead {
    let transfer_encoding: Vec<String> = head
        .headers
        .get_all("Transfer-Encoding")
        .map(str::to_string)
        .collect();

    head.headers = strip_hop_by_hop(&head.headers);
    for value in transfer_encoding {
        head.headers.append("Transfer-Encoding", value);
    }
    head.headers.set("Connection", "close");
    head
}

fn strip_hop_by_hop(headers: &Headers) -> Headers {
    let named: Vec<&str> = headers.tokens("Connection").collect();

    headers
        .iter()
        .filter(|(k, _)| {
            !HOP_BY_HOP.iter().any(|h| k.eq_ignore_ascii_case(h))
                && !named.iter().any(|n| k.eq_ignore_ascii_case(n))
        })
        .collect()
}

/// Copy `reader` into `writer` until EOF, flushing buffered bytes at least
/// every `flush_every`. A read that sees nothing for `idle`, or a write the
/// other side does not drain within `idle`, fails with `TimedOut`.
pub async fn copy_with_flush<R, W>(
    reader: &mut R,
    writer: &mut W,
    flush_every: Duration,
    idle: Duration,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut writer = BufWriter::new(writer);
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut ticker = tokio::time::interval(flush_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut total = 0u64;
    let mut dirty = false;

    loop {
        tokio::select! {
            read = timeout(idle, reader.read(&mut buf)) => {
                let n = read.map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "backend went idle")
                })??;
                if n == 0 {
                    break;
                }
                write_all_within(&mut writer, &buf[..n], idle).await?;
                total += n as u64;
                dirty = true;
            }
            _ = ticker.tick(), if dirty => {
                flush_within(&mut writer, idle).await?;
                dirty = false;
            }
        }
    }

    flush_within(&mut writer, idle).await?;
    Ok(total)
}

async fn write_all_within<W>(writer: &mut W, buf: &[u8], idle: Duration) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    timeout(idle, writer.write_all(buf))
        .await
        .map_err(|_| stalled_writer())?
}

async fn flush_within<W>(writer: &mut W, idle: Duration) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    timeout(idle, writer.flush()).await.map_err(|_| stalled_writer())?
}

fn stalled_writer() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, "client stopped reading")
}

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::http::headers::Headers;
use crate::http::request::Method;
use crate::http::response::{Response, ResponseHead};

const HTTP_VERSION: &str = "HTTP/1.1";

fn write_headers(buf: &mut Vec<u8>, headers: &Headers) {
    for (k, v) in headers.iter() {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");
}

/// Serializes a locally generated response. A response that ends the
/// connection announces it with `Connection: close`.
pub fn serialize_response(resp: &Response, keep_alive: bool) -> Vec<u8> {
    let mut buf = Vec::new();

    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        resp.status.as_u16(),
        resp.status.reason_phrase()
    );
    buf.extend_from_slice(status_line.as_bytes());

    let mut headers = resp.headers.clone();
    if !keep_alive {
        headers.set("Connection", "close");
    }
    write_headers(&mut buf, &headers);

    buf.extend_from_slice(&resp.body);

    buf
}

/// Serializes a relayed response head; the body is streamed separately.
pub fn serialize_response_head(head: &ResponseHead) -> Vec<u8> {
    let mut buf = Vec::new();

    let status_line = if head.reason.is_empty() {
        format!("{} {}\r\n", head.version, head.status)
    } else {
        format!("{} {} {}\r\n", head.version, head.status, head.reason)
    };
    buf.extend_from_slice(status_line.as_bytes());
    write_headers(&mut buf, &head.headers);

    buf
}

/// Serializes a request line and headers for a backend.
pub fn serialize_request_head(method: &Method, path: &str, headers: &Headers) -> Vec<u8> {
    let mut buf = Vec::new();

    let request_line = format!("{} {} {}\r\n", method.as_str(), path, HTTP_VERSION);
    buf.extend_from_slice(request_line.as_bytes());
    write_headers(&mut buf, headers);

    buf
}

pub struct ResponseWriter {
    buffer: Vec<u8>,
    written: usize,
}

impl ResponseWriter {
    pub fn new(response: &Response, keep_alive: bool) -> Self {
        Self {
            buffer: serialize_response(response, keep_alive),
            written: 0,
        }
    }

    pub async fn write_to_stream<W>(&mut self, stream: &mut W) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        while self.written < self.buffer.len() {
            let n = stream
                .write(&self.buffer[self.written..])
                .await?;

            if n == 0 {
                return Err(anyhow::anyhow!("connection closed while writing"));
            }

            self.written += n;
        }

        stream.flush().await?;
        Ok(())
    }
}

use crate::http::headers::Headers;
use crate::http::request::{Method, Request};
use crate::http::response::ResponseHead;

/// Upper bound on a request or response head (request line and headers).
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Upper bound on a buffered request body.
pub const MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    InvalidHeader,
    InvalidContentLength,
    InvalidChunk,
    InvalidStatus,
    HeadersTooLarge,
    BodyTooLarge,
    Incomplete,
}

pub fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    let headers_end = find_headers_end(buf)?;
    let header_bytes = &buf[..headers_end];
    let body_bytes = &buf[headers_end + 4..];

    let headers_str = std::str::from_utf8(header_bytes)
        .map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split_whitespace();

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let path = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;

    if !version.starts_with("HTTP/") || parts.next().is_some() {
        return Err(ParseError::InvalidRequest);
    }

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;
    let headers = parse_header_lines(lines)?;

    // Body
    let chunked = headers.has_token("Transfer-Encoding", "chunked");
    let (body, body_consumed) = if chunked {
        decode_chunked(body_bytes)?
    } else {
        let content_length = headers
            .get("Content-Length")
            .map(|v| v.trim().parse::<usize>().map_err(|_| ParseError::InvalidContentLength))
            .transpose()?
            .unwrap_or(0);

        if content_length > MAX_BODY_SIZE {
            return Err(ParseError::BodyTooLarge);
        }
        if body_bytes.len() < content_length {
            return Err(ParseError::Incomplete);
        }
        (body_bytes[..content_length].to_vec(), content_length)
    };

    let request = Request {
        method,
        path: path.to_string(),
        version: version.to_string(),
        headers,
        body,
    };

    Ok((request, headers_end + 4 + body_consumed))
}

/// Parses a backend's status line and headers. The body is left in the
/// buffer for the caller to stream.
pub fn parse_response_head(buf: &[u8]) -> Result<(ResponseHead, usize), ParseError> {
    let headers_end = find_headers_end(buf)?;

    let head_str = std::str::from_utf8(&buf[..headers_end])
        .map_err(|_| ParseError::InvalidStatus)?;
    let mut lines = head_str.split("\r\n");

    let status_line = lines.next().ok_or(ParseError::InvalidStatus)?;
    let mut parts = status_line.splitn(3, ' ');

    let version = parts.next().filter(|v| v.starts_with("HTTP/"));
    let version = version.ok_or(ParseError::InvalidStatus)?;
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|s| (100..1000).contains(s))
        .ok_or(ParseError::InvalidStatus)?;
    let reason = parts.next().unwrap_or("").trim();

    let head = ResponseHead {
        version: version.to_string(),
        status,
        reason: reason.to_string(),
        headers: parse_header_lines(lines)?,
    };

    Ok((head, headers_end + 4))
}

/// Whether `buf` holds a complete HTTP/1.1 request head that asks for
/// `100 Continue` before the client sends its body.
pub fn expects_continue(buf: &[u8]) -> bool {
    let Ok(headers_end) = find_headers_end(buf) else {
        return false;
    };
    let Ok(head) = std::str::from_utf8(&buf[..headers_end]) else {
        return false;
    };

    let mut lines = head.split("\r\n");
    let http11 = lines
        .next()
        .is_some_and(|line| line.trim_end().ends_with("HTTP/1.1"));

    http11 && parse_header_lines(lines).is_ok_and(|h| h.has_token("Expect", "100-continue"))
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers, ParseError> {
    let mut headers = Headers::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let (key, value) = line
            .split_once(':')
            .ok_or(ParseError::InvalidHeader)?;

        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(ParseError::InvalidHeader);
        }

        headers.append(key, value.trim());
    }

    Ok(headers)
}

fn find_headers_end(buf: &[u8]) -> Result<usize, ParseError> {
    match buf.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(end) if end > MAX_HEAD_SIZE => Err(ParseError::HeadersTooLarge),
        Some(end) => Ok(end),
        None if buf.len() > MAX_HEAD_SIZE => Err(ParseError::HeadersTooLarge),
        None => Err(ParseError::Incomplete),
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Decodes a chunked body. Returns the payload and the number of framed
/// bytes consumed, trailers included.
///
/// Framing is validated before anything is copied, so re-parsing a buffer
/// that is still filling up only walks the chunk headers.
fn decode_chunked(buf: &[u8]) -> Result<(Vec<u8>, usize), ParseError> {
    let mut chunks = Vec::new();
    let mut body_len = 0usize;
    let mut pos = 0;

    loop {
        let line_len = find_crlf(&buf[pos..]).ok_or(ParseError::Incomplete)?;
        let line = std::str::from_utf8(&buf[pos..pos + line_len])
            .map_err(|_| ParseError::InvalidChunk)?;
        let size_str = line.split_once(';').map_or(line, |(size, _)| size).trim();
        let size = usize::from_str_radix(size_str, 16).map_err(|_| ParseError::InvalidChunk)?;
        pos += line_len + 2;

        if size == 0 {
            // Trailers run until an empty line; they are not forwarded.
            loop {
                let trailer_len = find_crlf(&buf[pos..]).ok_or(ParseError::Incomplete)?;
                pos += trailer_len + 2;
                if trailer_len == 0 {
                    let mut body = Vec::with_capacity(body_len);
                    for (start, end) in chunks {
                        body.extend_from_slice(&buf[start..end]);
                    }
                    return Ok((body, pos));
                }
            }
        }

        body_len = body_len.saturating_add(size);
        if body_len > MAX_BODY_SIZE {
            return Err(ParseError::BodyTooLarge);
        }

        let chunk_end = pos + size;
        if buf.len() < chunk_end + 2 {
            return Err(ParseError::Incomplete);
        }
        if &buf[chunk_end..chunk_end + 2] != b"\r\n" {
            return Err(ParseError::InvalidChunk);
        }

        chunks.push((pos, chunk_end));
        pos = chunk_end + 2;
    }
}

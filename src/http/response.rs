use crate::http::headers::Headers;

/// Status codes the proxy produces on its own.
///
/// Responses relayed from a backend keep the backend's numeric status
/// in [`ResponseHead`] and never pass through this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 200 OK
    Ok,
    /// 400 Bad Request
    BadRequest,
    /// 413 Payload Too Large
    PayloadTooLarge,
    /// 431 Request Header Fields Too Large
    HeadersTooLarge,
    /// 500 Internal Server Error
    InternalServerError,
    /// 502 Bad Gateway
    BadGateway,
    /// 504 Gateway Timeout
    GatewayTimeout,
}

impl StatusCode {
    /// Returns the numeric HTTP status code.
    ///
    /// ```
    /// # use pingbridge::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// assert_eq!(StatusCode::BadGateway.as_u16(), 502);
    /// ```
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::HeadersTooLarge => 431,
            StatusCode::InternalServerError => 500,
            StatusCode::BadGateway => 502,
            StatusCode::GatewayTimeout => 504,
        }
    }

    /// Returns the standard HTTP reason phrase for this status code.
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::PayloadTooLarge => "Payload Too Large",
            StatusCode::HeadersTooLarge => "Request Header Fields Too Large",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::BadGateway => "Bad Gateway",
            StatusCode::GatewayTimeout => "Gateway Timeout",
        }
    }
}

/// A response generated locally by the proxy.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Status line and headers of a response relayed from a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

/// Builder for constructing HTTP responses in a fluent style.
///
/// ```ignore
/// let response = ResponseBuilder::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(b"{}".to_vec())
///     .build();
/// ```
pub struct ResponseBuilder {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Adds or replaces a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(key, value);
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Builds the final Response, adding `Content-Length` unless one was set.
    pub fn build(mut self) -> Response {
        if !self.headers.contains("Content-Length") {
            self.headers.set("Content-Length", self.body.len().to_string());
        }

        Response {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }
}

impl Response {
    /// Plain-text response with the given status and body.
    pub fn text(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        ResponseBuilder::new(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body.into())
            .build()
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        ResponseBuilder::new(StatusCode::Ok)
            .body(body.into())
            .build()
    }

    /// 400 for requests whose host does not resolve to a live route.
    pub fn could_not_route() -> Self {
        Self::text(StatusCode::BadRequest, "could not route given host\n")
    }

    pub fn bad_request() -> Self {
        Self::text(StatusCode::BadRequest, "400 Bad Request\n")
    }

    pub fn payload_too_large() -> Self {
        Self::text(StatusCode::PayloadTooLarge, "413 Payload Too Large\n")
    }

    pub fn headers_too_large() -> Self {
        Self::text(StatusCode::HeadersTooLarge, "431 Request Header Fields Too Large\n")
    }

    /// 500 carrying a short error description, e.g. a failed backend dial.
    pub fn internal_error(detail: impl std::fmt::Display) -> Self {
        Self::text(StatusCode::InternalServerError, format!("{detail}\n"))
    }

    pub fn bad_gateway() -> Self {
        Self::text(
            StatusCode::BadGateway,
            "502 Bad Gateway\n\nFailed to reach the backend server.\n",
        )
    }

    pub fn gateway_timeout() -> Self {
        Self::text(
            StatusCode::GatewayTimeout,
            "504 Gateway Timeout\n\nThe backend server did not respond in time.\n",
        )
    }
}

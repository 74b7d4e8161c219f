use crate::http::headers::Headers;

/// HTTP request methods.
///
/// The proxy forwards every method it can parse; anything outside this list
/// is rejected with 400 Bad Request before routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    OPTIONS,
    PATCH,
    CONNECT,
    TRACE,
}

/// A parsed HTTP/1.x request from a client.
///
/// `path` holds the request target exactly as sent, which may be in
/// absolute form (`http://host/path`) when the client talks to us as a
/// forward proxy. The body is already de-chunked.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Builder for constructing Request objects.
#[derive(Default)]
pub struct RequestBuilder {
    method: Option<Method>,
    path: Option<String>,
    version: Option<String>,
    headers: Headers,
    body: Vec<u8>,
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// Methods are case-sensitive, so `"get"` is not a method.
    ///
    /// ```
    /// # use pingbridge::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            "CONNECT" => Some(Method::CONNECT),
            "TRACE" => Some(Method::TRACE),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::CONNECT => "CONNECT",
            Method::TRACE => "TRACE",
        }
    }

    /// Whether a request with this method carries a body by convention, so
    /// an empty one still needs an explicit `Content-Length: 0` upstream.
    pub fn expects_body(&self) -> bool {
        matches!(self, Method::POST | Method::PUT | Method::PATCH)
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(key, value);
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> Result<Request, &'static str> {
        Ok(Request {
            method: self.method.ok_or("method missing")?,
            path: self.path.ok_or("path missing")?,
            version: self.version.unwrap_or_else(|| "HTTP/1.1".to_string()),
            headers: self.headers,
            body: self.body,
        })
    }
}

impl Request {
    /// Retrieves a header value by name, ignoring case.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// Parsed `Content-Length`, or 0 when missing or not a number.
    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn is_chunked(&self) -> bool {
        self.headers.has_token("Transfer-Encoding", "chunked")
    }

    /// Determines whether the connection should remain open after the response.
    ///
    /// HTTP/1.1 stays open unless the client sent `Connection: close`;
    /// HTTP/1.0 only stays open on an explicit `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("Connection", "close") {
            return false;
        }
        if self.version.eq_ignore_ascii_case("HTTP/1.0") {
            return self.headers.has_token("Connection", "keep-alive");
        }
        true
    }

    /// The authority the client asked for, port included if one was sent.
    ///
    /// An absolute-form target wins over the `Host` header.
    pub fn host(&self) -> Option<String> {
        if let Some(url) = self.absolute_target() {
            let host = url.host_str()?;
            return Some(match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            });
        }

        self.header("Host")
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
    }

    /// The request target in origin form (`/path?query`).
    pub fn origin_path(&self) -> String {
        match self.absolute_target() {
            Some(url) => match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            },
            None if self.path.is_empty() => "/".to_string(),
            None => self.path.clone(),
        }
    }

    /// `Connection: upgrade` together with `Upgrade: websocket`, both
    /// compared case-insensitively.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers.has_token("Connection", "upgrade")
            && self.headers.has_token("Upgrade", "websocket")
    }

    fn absolute_target(&self) -> Option<url::Url> {
        if !self.path.contains("://") {
            return None;
        }
        url::Url::parse(&self.path).ok()
    }
}

//! Host-based dispatch
//!
//! Turns an inbound request into a [`Dispatch`]: which backend to dial, what
//! Host it should see and whether the exchange is plain HTTP or a WebSocket
//! upgrade. The request headers are rewritten in place on the way.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use url::Url;

use crate::http::headers::Headers;
use crate::http::request::Request;
use crate::route::{Route, RouteRegistry};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no host")]
    MissingHost,

    #[error("no matched route for prefix")]
    NoRoute,

    #[error("invalid target host {0:?}")]
    InvalidHost(String),
}

/// How a resolved request reaches its backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Http,
    WebSocket,
}

/// Where and how to forward one request
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// Route the request resolved to
    pub route: Route,
    /// `route.address:route.port`
    pub fwd_addr: SocketAddr,
    /// Host header value sent upstream, routing prefix removed
    pub host: String,
    /// Backend URL with the scheme picked from the route's TLS flag
    pub target: Url,
    pub strategy: Strategy,
}

#[derive(Debug, Clone)]
pub struct HostDispatcher {
    registry: RouteRegistry,
    whitelist_suffixes: Arc<[String]>,
}

impl HostDispatcher {
    pub fn new(registry: RouteRegistry, whitelist_suffixes: Vec<String>) -> Self {
        Self {
            registry,
            whitelist_suffixes: whitelist_suffixes.into(),
        }
    }

    /// Resolve `request` to a backend.
    ///
    /// On success the request has been rewritten for the backend: origin-form
    /// target, Host without the routing prefix and the client appended to
    /// `X-Forwarded-For`. On failure it is left untouched.
    pub async fn resolve(
        &self,
        request: &mut Request,
        client_ip: IpAddr,
    ) -> Result<Dispatch, DispatchError> {
        let original_host = request.host().ok_or(DispatchError::MissingHost)?;

        let route = self
            .registry
            .lookup(host_without_port(&original_host), &self.whitelist_suffixes)
            .await
            .ok_or(DispatchError::NoRoute)?;

        let host = strip_route_prefix(&original_host, &route.prefix).to_string();

        let strategy = if request.is_websocket_upgrade() {
            Strategy::WebSocket
        } else {
            Strategy::Http
        };

        let scheme = match (strategy, route.secure) {
            (Strategy::Http, false) => "http",
            (Strategy::Http, true) => "https",
            (Strategy::WebSocket, false) => "ws",
            (Strategy::WebSocket, true) => "wss",
        };

        let path = request.origin_path();
        let target = target_url(scheme, &host, &path)?;

        request.path = path;
        request.headers.set("Host", host.clone());
        append_forwarded_for(&mut request.headers, client_ip);

        Ok(Dispatch {
            fwd_addr: route.socket_addr(),
            route,
            host,
            target,
            strategy,
        })
    }
}

fn target_url(scheme: &str, host: &str, path: &str) -> Result<Url, DispatchError> {
    let mut target = Url::parse(&format!("{scheme}://{host}/"))
        .map_err(|_| DispatchError::InvalidHost(host.to_string()))?;

    if path.starts_with('/') {
        let (path, query) = match path.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path, None),
        };
        target.set_path(path);
        target.set_query(query);
    }

    Ok(target)
}

/// Drop the leading `"<prefix>."` from a host, keeping any port.
pub fn strip_route_prefix<'a>(host: &'a str, prefix: &str) -> &'a str {
    host.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(host)
}

/// The host part of an authority (`host[:port]`).
pub fn host_without_port(authority: &str) -> &str {
    match authority.rsplit_once(':') {
        Some((host, port))
            if !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && (!host.contains(':') || host.ends_with(']')) =>
        {
            host
        }
        _ => authority,
    }
}

/// Append the client to `X-Forwarded-For`, after any values already present.
pub fn append_forwarded_for(headers: &mut Headers, client_ip: IpAddr) {
    let prior: Vec<&str> = headers.get_all("X-Forwarded-For").collect();
    let value = if prior.is_empty() {
        client_ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };
    headers.set("X-Forwarded-For", value);
}

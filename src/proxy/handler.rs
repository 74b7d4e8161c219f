use std::net::IpAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::config::Config;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::proxy::dispatch::{HostDispatcher, Strategy};
use crate::proxy::forward::HttpForwarder;
use crate::proxy::upstream::{Upstream, UpstreamError};
use crate::proxy::websocket::WebSocketBridge;
use crate::route::RouteRegistry;

/// What the connection should do after a request was handled
#[derive(Debug)]
pub enum Outcome {
    /// Answer locally and keep serving the connection
    Respond(Response),
    /// The request was proxied; the connection is done
    Proxied,
}

/// Handles proxying requests to backend servers
#[derive(Clone)]
pub struct ProxyHandler {
    dispatcher: HostDispatcher,
    forwarder: HttpForwarder,
    bridge: WebSocketBridge,
    idle_timeout: Duration,
}

impl ProxyHandler {
    pub fn new(dispatcher: HostDispatcher, upstream: Upstream, idle_timeout: Duration) -> Self {
        Self {
            dispatcher,
            forwarder: HttpForwarder::new(upstream.clone(), idle_timeout),
            bridge: WebSocketBridge::new(upstream, idle_timeout),
            idle_timeout,
        }
    }

    pub fn from_config(registry: RouteRegistry, cfg: &Config) -> Result<Self, UpstreamError> {
        let dispatcher = HostDispatcher::new(registry, cfg.whitelist_suffixes.clone());
        let upstream = Upstream::new(cfg.connect_timeout, cfg.tls_skip_verify)?;
        Ok(Self::new(dispatcher, upstream, cfg.idle_timeout))
    }

    /// Longest silence tolerated on a client or backend connection
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Route `request` and forward it over the strategy it calls for
    ///
    /// `pending` holds bytes read from `client` past the end of `request`.
    pub async fn handle<C>(
        &self,
        client: &mut C,
        pending: &[u8],
        mut request: Request,
        client_ip: IpAddr,
    ) -> anyhow::Result<Outcome>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let host = request.host().unwrap_or_default();
        debug!(host = %host, path = %request.path, ip = %client_ip, "proxy request");

        let dispatch = match self.dispatcher.resolve(&mut request, client_ip).await {
            Ok(dispatch) => dispatch,
            Err(e) => {
                warn!(host = %host, path = %request.path, ip = %client_ip, error = %e, "could not route");
                return Ok(Outcome::Respond(Response::could_not_route()));
            }
        };

        debug!(
            host = %host,
            prefix = %dispatch.route.prefix,
            fwd_addr = %dispatch.fwd_addr,
            target = %dispatch.target,
            strategy = ?dispatch.strategy,
            "dispatching"
        );

        match dispatch.strategy {
            Strategy::Http => self.forwarder.forward(client, &request, &dispatch).await?,
            Strategy::WebSocket => {
                self.bridge
                    .bridge(client, pending, &request, &dispatch)
                    .await?
            }
        }

        Ok(Outcome::Proxied)
    }
}

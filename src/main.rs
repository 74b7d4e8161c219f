use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pingbridge::config::Config;
use pingbridge::proxy::ProxyHandler;
use pingbridge::route::{RouteRegistry, Sweeper};
use pingbridge::{ping, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load().context("invalid configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();

    let registry = RouteRegistry::new();
    let sweeper = Sweeper::spawn(registry.clone(), cfg.ping_timeout);
    let handler = ProxyHandler::from_config(registry.clone(), &cfg)
        .context("couldn't set up backend connector")?;

    if cfg.tls_skip_verify {
        warn!("backend TLS certificates will not be verified");
    }
    if cfg.whitelist_suffixes.is_empty() {
        warn!("no host whitelist configured, any host can be routed");
    }

    let result = tokio::select! {
        res = ping::listener::run(&cfg.ping_addr, registry) => res,
        res = server::listener::run(&cfg.listen_addr, handler) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    sweeper.shutdown().await;
    result
}

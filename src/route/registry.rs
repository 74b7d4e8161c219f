//! Live routing table
//!
//! Maps a hostname prefix to the backend that most recently heartbeated for
//! it. Entries are only ever removed by [`RouteRegistry::evict`].

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// A backend currently claiming a prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Leading hostname label this backend serves
    pub prefix: String,

    /// Address the heartbeat arrived from
    pub address: IpAddr,

    /// Port the backend listens on
    pub port: u16,

    /// Whether the backend expects TLS
    pub secure: bool,

    /// Stamped by the registry on every record
    pub last_seen: Option<Instant>,
}

impl Route {
    pub fn new(prefix: impl Into<String>, address: IpAddr, port: u16, secure: bool) -> Self {
        Self {
            prefix: prefix.into(),
            address,
            port,
            secure,
            last_seen: None,
        }
    }

    /// `address:port` to dial for this route
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Time since the last heartbeat, `None` if never recorded
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.last_seen.map(|seen| now.saturating_duration_since(seen))
    }
}

/// Concurrent prefix → route table behind a single read-write lock
#[derive(Debug, Clone, Default)]
pub struct RouteRegistry {
    routes: Arc<RwLock<HashMap<String, Route>>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the route for `route.prefix`, stamped with now
    pub async fn record(&self, route: Route) {
        self.record_seen_at(route, Instant::now()).await;
    }

    /// Insert or replace the route for `route.prefix` with an explicit
    /// last-seen time
    pub async fn record_seen_at(&self, mut route: Route, seen: Instant) {
        route.last_seen = Some(seen);

        let mut routes = self.routes.write().await;
        routes.insert(route.prefix.clone(), route);
    }

    /// Find the route for a request directed at `host`
    ///
    /// `host` must not carry a port. When `whitelist_suffixes` is non-empty
    /// the host has to end in one of them on a label boundary, otherwise
    /// nothing is returned no matter what the table holds.
    pub async fn lookup(&self, host: &str, whitelist_suffixes: &[String]) -> Option<Route> {
        if !matches_whitelist(host, whitelist_suffixes) {
            return None;
        }

        let prefix = host_prefix(host);
        let routes = self.routes.read().await;
        routes.get(prefix).cloned()
    }

    /// Drop every route whose last heartbeat is older than `timeout`
    ///
    /// Returns the number of routes removed.
    pub async fn evict(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();

        {
            let mut routes = self.routes.write().await;
            routes.retain(|prefix, route| {
                let stale = route.age(now).is_none_or(|age| age > timeout);
                if stale {
                    expired.push(prefix.clone());
                }
                !stale
            });
        }

        for prefix in &expired {
            tracing::warn!(prefix = %prefix, "route timed out");
        }

        expired.len()
    }

    /// Snapshot of every route (for monitoring/debugging)
    pub async fn routes(&self) -> Vec<Route> {
        self.routes.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.routes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.routes.read().await.is_empty()
    }
}

/// The leading label of `host`, i.e. everything before the first `.`
pub fn host_prefix(host: &str) -> &str {
    host.split_once('.').map_or(host, |(prefix, _)| prefix)
}

/// Whether `host` ends in one of `suffixes`, compared on a label boundary
///
/// An empty suffix list allows every host. Suffixes may be given with or
/// without their leading dot.
pub fn matches_whitelist(host: &str, suffixes: &[String]) -> bool {
    if suffixes.is_empty() {
        return true;
    }

    suffixes.iter().any(|suffix| {
        let bare = suffix.strip_prefix('.').unwrap_or(suffix);
        !bare.is_empty()
            && host
                .strip_suffix(bare)
                .is_some_and(|rest| rest.ends_with('.'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_first_label() {
        assert_eq!(host_prefix("demo.foo.com"), "demo");
        assert_eq!(host_prefix("demo"), "demo");
        assert_eq!(host_prefix(".foo"), "");
    }

    #[test]
    fn whitelist_needs_label_boundary() {
        let suffixes = vec!["example.com".to_string()];
        assert!(matches_whitelist("foo.example.com", &suffixes));
        assert!(matches_whitelist("a.b.example.com", &suffixes));
        assert!(!matches_whitelist("fooexample.com", &suffixes));
        assert!(!matches_whitelist("example.com", &suffixes));
    }

    #[test]
    fn whitelist_accepts_leading_dot() {
        let suffixes = vec![".example.com".to_string()];
        assert!(matches_whitelist("foo.example.com", &suffixes));
        assert!(!matches_whitelist("foo.other.com", &suffixes));
    }

    #[test]
    fn empty_whitelist_allows_everything() {
        assert!(matches_whitelist("anything.at.all", &[]));
    }
}

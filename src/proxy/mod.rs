//! Reverse proxy functionality
//!
//! Host-based dispatch to heartbeat-registered backends, plain HTTP
//! forwarding, and WebSocket bridging.

pub mod dispatch;
pub mod forward;
pub mod handler;
pub mod upstream;
pub mod websocket;

pub use dispatch::{Dispatch, DispatchError, HostDispatcher, Strategy};
pub use handler::{Outcome, ProxyHandler};
pub use upstream::{Upstream, UpstreamError};

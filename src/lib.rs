//! pingbridge - dynamic reverse proxy
//!
//! Backends announce themselves with UDP heartbeats; HTTP and WebSocket
//! traffic is routed to them by the leftmost label of the request host.

pub mod config;
pub mod http;
pub mod ping;
pub mod proxy;
pub mod route;
pub mod server;

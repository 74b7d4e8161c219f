//! Heartbeat ingestion
//!
//! Backends announce themselves with fire-and-forget UDP datagrams. Each
//! valid heartbeat creates or refreshes the route for its prefix.

pub mod heartbeat;
pub mod listener;

pub use heartbeat::{Heartbeat, HeartbeatError};

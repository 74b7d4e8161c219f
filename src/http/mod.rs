//! HTTP/1.1 protocol implementation.
//!
//! A small HTTP/1.1 front end for the proxy: enough to read client requests,
//! answer the ones that cannot be routed, and relay the rest.
//!
//! # Architecture
//!
//! - **`connection`**: Per-client state machine
//! - **`parser`**: Parses requests, and backend response heads, from byte buffers
//! - **`headers`**: Ordered, case-insensitive header list
//! - **`request`**: HTTP request representation
//! - **`response`**: Locally generated responses and relayed response heads
//! - **`writer`**: Serializes responses and upstream request heads
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Wait for incoming request data
//!        └──────┬──────┘
//!               │ Request received
//!               ▼
//!        ┌──────────────────┐
//!        │   Processing     │ ← Route the request
//!        └──────┬───────────┘
//!               ├─ Proxied (HTTP or WebSocket) → Closed
//!               │ Unroutable: local response
//!               ▼
//!        ┌──────────────────┐
//!        │    Writing       │ ← Send response to client
//!        └──────┬───────────┘
//!               │ Response sent
//!               ├─ Keep-Alive → Reading (same connection)
//!               └─ Close → Closed
//! ```

pub mod connection;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;

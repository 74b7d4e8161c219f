//! Heartbeat payload decoding.
//!
//! A heartbeat is a single JSON datagram:
//!
//! ```text
//! { "prefix": "demo", "port": 8000, "https": false }
//! ```
//!
//! `prefix` and `port` are required, `https` defaults to `false`. Any other
//! field, including an address the sender claims for itself, is ignored: the
//! route address always comes from the datagram's source.

use std::net::IpAddr;

use serde::Deserialize;

use crate::route::Route;

/// Datagrams are read into a buffer of this size; anything longer is
/// truncated before decoding.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("malformed heartbeat: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("heartbeat is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid prefix {0:?}")]
    InvalidPrefix(String),

    #[error("port {0} is out of range")]
    InvalidPort(u64),
}

#[derive(Debug, Deserialize)]
struct Payload {
    prefix: Option<String>,
    port: Option<u64>,
    #[serde(default)]
    https: bool,
}

/// A decoded, validated heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub prefix: String,
    pub port: u16,
    pub secure: bool,
}

impl Heartbeat {
    pub fn decode(payload: &[u8]) -> Result<Self, HeartbeatError> {
        let payload: Payload = serde_json::from_slice(payload)?;

        let prefix = payload.prefix.ok_or(HeartbeatError::MissingField("prefix"))?;
        // A dotted prefix could never match the first label of a hostname.
        if prefix.is_empty() || prefix.contains('.') {
            return Err(HeartbeatError::InvalidPrefix(prefix));
        }

        let port = payload.port.ok_or(HeartbeatError::MissingField("port"))?;
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(HeartbeatError::InvalidPort(port))?;

        Ok(Self {
            prefix,
            port,
            secure: payload.https,
        })
    }

    /// Turn the heartbeat into a route served from `address`.
    pub fn into_route(self, address: IpAddr) -> Route {
        Route::new(self.prefix, address, self.port, self.secure)
    }
}

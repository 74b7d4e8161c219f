//! TCP front door for proxied HTTP traffic.

pub mod listener;

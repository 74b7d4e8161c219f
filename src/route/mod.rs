//! Route table
//!
//! The registry of live backends keyed by hostname prefix, and the sweep
//! task that expires backends which stop heartbeating.

pub mod registry;
pub mod sweeper;

pub use registry::{Route, RouteRegistry};
pub use sweeper::Sweeper;

//! kvnode Ingress
//!
//! This crate provides the network-facing side of the node:
//! - Per-connection protocol sessions dispatching binary requests
//! - Tap streams turning bucket mutations into outbound packets
//! - Stats streaming
//! - The TCP listener spawning one session task per connection

pub mod listener;
pub mod session;
pub mod stats;
pub mod tap;

pub use listener::Listener;
pub use session::Session;
pub use tap::TapError;

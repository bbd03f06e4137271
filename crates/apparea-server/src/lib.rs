//! apparea-server: reverse-tunnel gateway.
//!
//! Peers authenticate over an external multiplexed transport, then ask for
//! public surfaces: raw TCP listeners, or HTTP/HTTPS virtual hosts on one
//! shared listener. Public traffic is relayed back over per-connection
//! sub-channels.

pub mod config;
pub mod forward;
pub mod server;
pub mod session;

pub use config::ServerConfig;
pub use server::TunnelServer;

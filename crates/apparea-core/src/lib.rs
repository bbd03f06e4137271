//! apparea-core: shared protocol library for the apparea reverse-tunnel gateway.
//!
//! Provides the forward-request wire codec, the error taxonomy, the abstract
//! multiplexed transport the server runs on (plus an in-process
//! implementation), and the `authorized_keys`-backed identity store.

pub mod codec;
pub mod error;
pub mod identity;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{ForwardRequest, ForwardedTcpip, FORWARDED_TCPIP, TCPIP_FORWARD};
pub use error::{BackendPhase, TunnelError, TunnelResult};
pub use identity::{virtual_hostname, AuthorizedUsers, Principal, UserDirectory};

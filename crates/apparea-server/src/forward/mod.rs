//! Forwarders: the public listening surfaces a peer can request.
//!
//! - [`raw::RawForwarder`] owns a TCP listener and relays each connection.
//! - [`http::HttpForwarder`] claims a virtual hostname on the shared
//!   [`router::VirtualHostRouter`] surface and proxies requests, optionally
//!   through a [`tls::TlsBridge`].

pub mod http;
pub mod raw;
pub mod relay;
pub mod router;
pub mod tls;

use apparea_core::{ForwardRequest, TunnelResult};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use http::{HttpForwarder, Scheme};
pub use raw::RawForwarder;
pub use router::{HttpSurfaceConfig, VirtualHostRouter};

/// Write-only sink for user-facing status lines of one session.
#[derive(Clone, Default)]
pub struct StatusLog {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl StatusLog {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that drops everything.
    pub fn discard() -> Self {
        Self::default()
    }

    pub fn post(&self, msg: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(msg.into());
        }
    }
}

/// A served or servable forward, one per successful `tcpip-forward`.
pub enum Forwarder {
    Raw(RawForwarder),
    Http(Arc<HttpForwarder>),
}

impl Forwarder {
    pub async fn serve(&mut self) -> TunnelResult<()> {
        match self {
            Forwarder::Raw(f) => f.serve().await,
            Forwarder::Http(f) => f.serve().await,
        }
    }

    /// Stop serving. Safe to call more than once.
    pub async fn close(&self) {
        match self {
            Forwarder::Raw(f) => f.close().await,
            Forwarder::Http(f) => f.close().await,
        }
    }

    /// `None` until `serve` has succeeded.
    pub fn listener_address(&self) -> Option<String> {
        match self {
            Forwarder::Raw(f) => f.listener_address(),
            Forwarder::Http(f) => f.listener_address(),
        }
    }

    pub fn listener_port(&self) -> Option<u32> {
        match self {
            Forwarder::Raw(f) => f.listener_port(),
            Forwarder::Http(f) => f.listener_port(),
        }
    }

    pub fn request(&self) -> &ForwardRequest {
        match self {
            Forwarder::Raw(f) => f.request(),
            Forwarder::Http(f) => f.request(),
        }
    }
}

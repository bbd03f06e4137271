//! Abstract multiplexed transport the gateway runs on.
//!
//! A peer connection carries out-of-band global requests, peer-initiated
//! channels and server-initiated reverse channels. The secure wire protocol
//! lives outside this crate; `memory` provides an in-process implementation.

pub mod memory;

use crate::error::TunnelResult;
use futures_util::future::BoxFuture;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

/// A bidirectional byte stream (a sub-channel, a TCP socket, a TLS session).
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

pub type ChannelStream = Box<dyn Duplex>;

/// An in-channel request (`shell`, `pty-req`, ...) sent by the peer.
pub struct ChannelRequest {
    pub request_type: String,
    pub want_reply: bool,
    pub payload: Vec<u8>,
    reply: Option<oneshot::Sender<bool>>,
}

impl ChannelRequest {
    /// Build a request; the receiver is present iff `want_reply` is set.
    pub fn new(
        request_type: impl Into<String>,
        want_reply: bool,
        payload: Vec<u8>,
    ) -> (Self, Option<oneshot::Receiver<bool>>) {
        let (reply, rx) = if want_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let req = Self {
            request_type: request_type.into(),
            want_reply,
            payload,
            reply,
        };
        (req, rx)
    }

    pub fn reply(self, ok: bool) {
        if let Some(tx) = self.reply {
            let _ = tx.send(ok);
        }
    }
}

impl fmt::Debug for ChannelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRequest")
            .field("request_type", &self.request_type)
            .field("want_reply", &self.want_reply)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// An accepted channel: the byte stream plus its in-channel requests.
pub struct OpenedChannel {
    pub stream: ChannelStream,
    pub requests: mpsc::Receiver<ChannelRequest>,
}

/// Server-side capability to open reverse channels toward a peer.
pub trait PeerHandle: Send + Sync {
    /// Authenticated login name of the peer.
    fn user(&self) -> &str;

    fn remote_addr(&self) -> SocketAddr;

    /// Open a channel of `channel_type` toward the peer and wait for it to
    /// accept or reject.
    fn open_channel(
        &self,
        channel_type: &str,
        payload: Vec<u8>,
    ) -> BoxFuture<'_, TunnelResult<OpenedChannel>>;
}

/// Reply to a global request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestReply {
    pub ok: bool,
    pub payload: Vec<u8>,
}

/// An out-of-band request on the peer connection (`tcpip-forward`, ...).
pub struct GlobalRequest {
    pub request_type: String,
    pub want_reply: bool,
    pub payload: Vec<u8>,
    reply: Option<oneshot::Sender<RequestReply>>,
}

impl GlobalRequest {
    pub fn new(
        request_type: impl Into<String>,
        want_reply: bool,
        payload: Vec<u8>,
    ) -> (Self, Option<oneshot::Receiver<RequestReply>>) {
        let (reply, rx) = if want_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let req = Self {
            request_type: request_type.into(),
            want_reply,
            payload,
            reply,
        };
        (req, rx)
    }

    /// Answer the request. A no-op when no reply was asked for.
    pub fn reply(self, ok: bool, payload: Vec<u8>) {
        if let Some(tx) = self.reply {
            let _ = tx.send(RequestReply { ok, payload });
        }
    }
}

/// Reason sent to the peer when a channel is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Prohibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Prohibited => f.write_str("administratively prohibited"),
            RejectReason::ConnectFailed => f.write_str("connect failed"),
            RejectReason::UnknownChannelType => f.write_str("unknown channel type"),
            RejectReason::ResourceShortage => f.write_str("resource shortage"),
        }
    }
}

/// Transport-specific half of a pending peer-initiated channel.
pub trait ChannelResponder: Send {
    fn accept(self: Box<Self>) -> BoxFuture<'static, TunnelResult<OpenedChannel>>;

    fn reject(self: Box<Self>, reason: RejectReason, message: String);
}

/// A channel the peer wants to open.
pub struct NewChannel {
    pub channel_type: String,
    pub payload: Vec<u8>,
    responder: Box<dyn ChannelResponder>,
}

impl NewChannel {
    pub fn new(
        channel_type: impl Into<String>,
        payload: Vec<u8>,
        responder: Box<dyn ChannelResponder>,
    ) -> Self {
        Self {
            channel_type: channel_type.into(),
            payload,
            responder,
        }
    }

    pub async fn accept(self) -> TunnelResult<OpenedChannel> {
        self.responder.accept().await
    }

    pub fn reject(self, reason: RejectReason, message: impl Into<String>) {
        self.responder.reject(reason, message.into());
    }
}

/// An authenticated peer connection. Both receivers end when the peer
/// disconnects.
pub struct PeerConnection {
    pub handle: Arc<dyn PeerHandle>,
    pub requests: mpsc::Receiver<GlobalRequest>,
    pub channels: mpsc::Receiver<NewChannel>,
}

/// A connection that has been accepted but not yet authenticated.
pub struct IncomingPeer {
    pub remote_addr: SocketAddr,
    pub handshake: BoxFuture<'static, TunnelResult<PeerConnection>>,
}

/// Source of incoming peers. `Ok(None)` means the listener is done.
pub trait Acceptor: Send {
    fn accept(&mut self) -> BoxFuture<'_, TunnelResult<Option<IncomingPeer>>>;
}

//! In-process transport built on `tokio::io::duplex` pipes.
//!
//! `connect` yields the server half (`PeerConnection`) and a `MemoryClient`
//! that plays the remote peer: it sends global requests, opens channels and
//! answers reverse channel opens.

use super::{
    Acceptor, ChannelRequest, ChannelResponder, GlobalRequest, IncomingPeer, NewChannel,
    OpenedChannel, PeerConnection, PeerHandle, RejectReason, RequestReply,
};
use crate::error::{TunnelError, TunnelResult};
use futures_util::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};

const PIPE_CAPACITY: usize = 64 * 1024;
const QUEUE_DEPTH: usize = 16;

/// Create a connected peer pair.
pub fn connect(user: impl Into<String>, remote_addr: SocketAddr) -> (MemoryClient, PeerConnection) {
    let (request_tx, request_rx) = mpsc::channel(QUEUE_DEPTH);
    let (channel_tx, channel_rx) = mpsc::channel(QUEUE_DEPTH);
    let (reverse_tx, reverse_rx) = mpsc::channel(QUEUE_DEPTH);

    let handle = MemoryHandle {
        user: user.into(),
        remote_addr,
        reverse: reverse_tx,
    };
    let client = MemoryClient {
        requests: request_tx,
        channels: channel_tx,
        reverse: reverse_rx,
    };
    let conn = PeerConnection {
        handle: Arc::new(handle),
        requests: request_rx,
        channels: channel_rx,
    };
    (client, conn)
}

/// Create a listener pair: dial on one end, accept on the other.
pub fn listener() -> (MemoryDialer, MemoryAcceptor) {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    (MemoryDialer { tx }, MemoryAcceptor { rx })
}

struct MemoryHandle {
    user: String,
    remote_addr: SocketAddr,
    reverse: mpsc::Sender<ReverseChannel>,
}

impl PeerHandle for MemoryHandle {
    fn user(&self) -> &str {
        &self.user
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn open_channel(
        &self,
        channel_type: &str,
        payload: Vec<u8>,
    ) -> BoxFuture<'_, TunnelResult<OpenedChannel>> {
        let channel_type = channel_type.to_string();
        Box::pin(async move {
            let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
            let (decision_tx, decision_rx) = oneshot::channel();
            let reverse = ReverseChannel {
                channel_type,
                payload,
                stream: remote,
                decision: decision_tx,
            };
            self.reverse
                .send(reverse)
                .await
                .map_err(|_| TunnelError::ChannelOpen("peer disconnected".into()))?;

            match decision_rx.await {
                Ok(true) => {
                    // Reverse channels carry no in-channel requests here.
                    let (_tx, requests) = mpsc::channel(1);
                    Ok(OpenedChannel {
                        stream: Box::new(local),
                        requests,
                    })
                }
                Ok(false) => Err(TunnelError::ChannelOpen("rejected by peer".into())),
                Err(_) => Err(TunnelError::ChannelOpen("peer disconnected".into())),
            }
        })
    }
}

/// A reverse channel open waiting for the client's decision.
pub struct ReverseChannel {
    pub channel_type: String,
    pub payload: Vec<u8>,
    stream: DuplexStream,
    decision: oneshot::Sender<bool>,
}

impl ReverseChannel {
    pub fn accept(self) -> DuplexStream {
        let _ = self.decision.send(true);
        self.stream
    }

    pub fn reject(self) {
        let _ = self.decision.send(false);
    }
}

/// Peer side of an in-process connection. Dropping it disconnects the peer.
pub struct MemoryClient {
    requests: mpsc::Sender<GlobalRequest>,
    channels: mpsc::Sender<NewChannel>,
    reverse: mpsc::Receiver<ReverseChannel>,
}

impl MemoryClient {
    /// Send a global request. Returns the reply when one was asked for.
    pub async fn request(
        &self,
        request_type: &str,
        want_reply: bool,
        payload: Vec<u8>,
    ) -> TunnelResult<Option<RequestReply>> {
        let (req, rx) = GlobalRequest::new(request_type, want_reply, payload);
        self.requests
            .send(req)
            .await
            .map_err(|_| TunnelError::Transport("connection closed".into()))?;
        match rx {
            Some(rx) => rx
                .await
                .map(Some)
                .map_err(|_| TunnelError::Transport("request dropped without reply".into())),
            None => Ok(None),
        }
    }

    /// Open a channel toward the server.
    pub async fn open_channel(
        &self,
        channel_type: &str,
        payload: Vec<u8>,
    ) -> TunnelResult<ClientChannel> {
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let (request_tx, request_rx) = mpsc::channel(QUEUE_DEPTH);
        let (decision_tx, decision_rx) = oneshot::channel();
        let responder = MemoryResponder {
            stream: remote,
            requests: request_rx,
            decision: decision_tx,
        };
        self.channels
            .send(NewChannel::new(channel_type, payload, Box::new(responder)))
            .await
            .map_err(|_| TunnelError::Transport("connection closed".into()))?;

        match decision_rx.await {
            Ok(Ok(())) => Ok(ClientChannel {
                stream: local,
                requests: request_tx,
            }),
            Ok(Err((reason, message))) => {
                Err(TunnelError::ChannelOpen(format!("{reason}: {message}")))
            }
            Err(_) => Err(TunnelError::Transport("channel open dropped".into())),
        }
    }

    /// Wait for the server to open the next reverse channel.
    pub async fn next_reverse(&mut self) -> Option<ReverseChannel> {
        self.reverse.recv().await
    }
}

/// Client end of a peer-initiated channel.
pub struct ClientChannel {
    pub stream: DuplexStream,
    requests: mpsc::Sender<ChannelRequest>,
}

impl ClientChannel {
    /// Send an in-channel request; `Some(ok)` is the server's answer.
    pub async fn request(
        &self,
        request_type: &str,
        want_reply: bool,
        payload: Vec<u8>,
    ) -> TunnelResult<Option<bool>> {
        let (req, rx) = ChannelRequest::new(request_type, want_reply, payload);
        self.requests
            .send(req)
            .await
            .map_err(|_| TunnelError::Transport("channel closed".into()))?;
        match rx {
            Some(rx) => rx
                .await
                .map(Some)
                .map_err(|_| TunnelError::Transport("request dropped without reply".into())),
            None => Ok(None),
        }
    }
}

struct MemoryResponder {
    stream: DuplexStream,
    requests: mpsc::Receiver<ChannelRequest>,
    decision: oneshot::Sender<Result<(), (RejectReason, String)>>,
}

impl ChannelResponder for MemoryResponder {
    fn accept(self: Box<Self>) -> BoxFuture<'static, TunnelResult<OpenedChannel>> {
        let this = *self;
        Box::pin(async move {
            this.decision
                .send(Ok(()))
                .map_err(|_| TunnelError::ChannelOpen("peer went away".into()))?;
            Ok(OpenedChannel {
                stream: Box::new(this.stream),
                requests: this.requests,
            })
        })
    }

    fn reject(self: Box<Self>, reason: RejectReason, message: String) {
        let _ = self.decision.send(Err((reason, message)));
    }
}

/// Dialing half of an in-process listener.
#[derive(Clone)]
pub struct MemoryDialer {
    tx: mpsc::Sender<IncomingPeer>,
}

impl MemoryDialer {
    /// Connect as `user`; the handshake succeeds immediately.
    pub async fn dial(&self, user: &str, remote_addr: SocketAddr) -> TunnelResult<MemoryClient> {
        let (client, conn) = connect(user, remote_addr);
        let incoming = IncomingPeer {
            remote_addr,
            handshake: Box::pin(async move { Ok(conn) }),
        };
        self.tx
            .send(incoming)
            .await
            .map_err(|_| TunnelError::Transport("listener closed".into()))?;
        Ok(client)
    }

    /// Connect with a handshake that fails with `reason`.
    pub async fn dial_failing(&self, remote_addr: SocketAddr, reason: &str) -> TunnelResult<()> {
        let reason = reason.to_string();
        let incoming = IncomingPeer {
            remote_addr,
            handshake: Box::pin(async move { Err(TunnelError::Transport(reason)) }),
        };
        self.tx
            .send(incoming)
            .await
            .map_err(|_| TunnelError::Transport("listener closed".into()))
    }
}

/// Accepting half of an in-process listener. Ends once every dialer is dropped.
pub struct MemoryAcceptor {
    rx: mpsc::Receiver<IncomingPeer>,
}

impl Acceptor for MemoryAcceptor {
    fn accept(&mut self) -> BoxFuture<'_, TunnelResult<Option<IncomingPeer>>> {
        Box::pin(async move { Ok(self.rx.recv().await) })
    }
}

//! HTTP and HTTPS forwarding through the shared virtual-host surface.
//!
//! Every proxied request opens a fresh `forwarded-tcpip` sub-channel, runs an
//! HTTP/1.1 client connection over it (inside a [`TlsBridge`] for HTTPS) and
//! streams the backend response back out.

use super::router::{text_response, ProxyBody, VirtualHostRouter};
use super::tls::TlsBridge;
use super::StatusLog;
use apparea_core::transport::{ChannelStream, OpenedChannel, PeerHandle};
use apparea_core::{
    BackendPhase, ForwardRequest, ForwardedTcpip, TunnelError, TunnelResult, FORWARDED_TCPIP,
};
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Protocol spoken to the peer's backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => f.write_str("http"),
            Scheme::Https => f.write_str("https"),
        }
    }
}

pub struct HttpForwarder {
    /// Backend address the peer asked for (port 80 or 443).
    request: ForwardRequest,
    /// Virtual hostname claimed on the shared surface.
    hostname: String,
    /// Whether backend traffic is wrapped in TLS.
    scheme: Scheme,
    /// Peer that receives a `forwarded-tcpip` channel per request.
    peer: Arc<dyn PeerHandle>,
    /// Shared virtual-host registry and surface.
    router: Arc<VirtualHostRouter>,
    /// Client config for the per-request TLS bridge; `None` for plain HTTP.
    tls: Option<Arc<ClientConfig>>,
    /// Session status sink for access lines.
    log: StatusLog,
    /// Surface address, set once the hostname is registered.
    surface: OnceLock<SocketAddr>,
    /// Set by the first `close`; a closed forwarder cannot be served.
    closed: AtomicBool,
}

impl HttpForwarder {
    /// Plain HTTP backend.
    pub fn http(
        request: ForwardRequest,
        hostname: impl Into<String>,
        peer: Arc<dyn PeerHandle>,
        router: Arc<VirtualHostRouter>,
        log: StatusLog,
    ) -> Arc<Self> {
        Arc::new(Self::build(request, hostname.into(), Scheme::Http, peer, router, None, log))
    }

    /// HTTPS backend; `tls` is used for every per-request bridge.
    pub fn https(
        request: ForwardRequest,
        hostname: impl Into<String>,
        peer: Arc<dyn PeerHandle>,
        router: Arc<VirtualHostRouter>,
        tls: Arc<ClientConfig>,
        log: StatusLog,
    ) -> Arc<Self> {
        Arc::new(Self::build(
            request,
            hostname.into(),
            Scheme::Https,
            peer,
            router,
            Some(tls),
            log,
        ))
    }

    fn build(
        request: ForwardRequest,
        hostname: String,
        scheme: Scheme,
        peer: Arc<dyn PeerHandle>,
        router: Arc<VirtualHostRouter>,
        tls: Option<Arc<ClientConfig>>,
        log: StatusLog,
    ) -> Self {
        Self {
            request,
            hostname,
            scheme,
            peer,
            router,
            tls,
            log,
            surface: OnceLock::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn request(&self) -> &ForwardRequest {
        &self.request
    }

    /// Claim the hostname on the shared surface.
    pub async fn serve(self: &Arc<Self>) -> TunnelResult<()> {
        if self.closed.load(Ordering::Acquire) || self.surface.get().is_some() {
            return Err(TunnelError::Other("forwarder already served".into()));
        }
        let addr = self.router.register(&self.hostname, self.clone()).await?;
        let _ = self.surface.set(addr);
        info!(
            user = self.peer.user(),
            hostname = %self.hostname,
            scheme = %self.scheme,
            "http forwarder registered"
        );
        Ok(())
    }

    /// Release the hostname. Idempotent; never removes another forwarder's
    /// registration.
    pub async fn close(self: &Arc<Self>) {
        self.closed.store(true, Ordering::Release);
        if self.router.unregister(&self.hostname, self).await {
            debug!(hostname = %self.hostname, "http forwarder closed");
        }
    }

    pub fn listener_address(&self) -> Option<String> {
        self.surface
            .get()
            .map(|_| format!("{}://{}", self.scheme, self.hostname))
    }

    pub fn listener_port(&self) -> Option<u32> {
        self.surface.get().map(|addr| u32::from(addr.port()))
    }

    /// Proxy one request to the backend, bounded by the surface's write
    /// timeout. Failures become 502, an expired deadline 504.
    pub async fn handle(&self, req: Request<Incoming>, remote: SocketAddr) -> Response<ProxyBody> {
        let started = chrono::Local::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let deadline = self.router.config().write_timeout;

        let resp = match tokio::time::timeout(deadline, self.proxy(req, remote)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                warn!(hostname = %self.hostname, %remote, error = %e, "backend request failed");
                text_response(StatusCode::BAD_GATEWAY, bad_gateway_body(&e))
            }
            Err(_) => {
                warn!(hostname = %self.hostname, %remote, "backend request timed out");
                text_response(StatusCode::GATEWAY_TIMEOUT, "gateway timeout")
            }
        };

        self.log.post(format!(
            "{} [{}] {} {}",
            started.format("%Y/%m/%d %H:%M:%S"),
            resp.status().as_u16(),
            method,
            path
        ));
        resp
    }

    async fn proxy(
        &self,
        req: Request<Incoming>,
        remote: SocketAddr,
    ) -> TunnelResult<Response<ProxyBody>> {
        let payload = ForwardedTcpip {
            host: self.request.host.clone(),
            port: self.request.port,
            originator_address: remote.ip().to_string(),
            originator_port: u32::from(remote.port()),
        }
        .encode();
        let OpenedChannel {
            stream,
            mut requests,
        } = self
            .peer
            .open_channel(FORWARDED_TCPIP, payload)
            .await
            .map_err(|e| TunnelError::backend(BackendPhase::OpenFailed, e))?;

        let discard = AbortOnDrop(tokio::spawn(async move {
            while let Some(req) = requests.recv().await {
                req.reply(false);
            }
        }));

        let io: ChannelStream = match &self.tls {
            Some(config) => {
                Box::new(TlsBridge::connect(stream, &self.request.host, config.clone()).await?)
            }
            None => stream,
        };

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
            .await
            .map_err(|e| TunnelError::backend(BackendPhase::WriteFailed, e))?;
        let hostname = self.hostname.clone();
        tokio::spawn(async move {
            let _discard = discard;
            if let Err(e) = conn.await {
                debug!(%hostname, error = %e, "backend connection ended with error");
            }
        });

        let resp = sender.send_request(req).await.map_err(|e| {
            let phase = if e.is_parse() || e.is_incomplete_message() {
                BackendPhase::ResponseParseFailed
            } else {
                BackendPhase::WriteFailed
            };
            TunnelError::backend(phase, e)
        })?;
        Ok(resp.map(|body| body.boxed_unsync()))
    }
}

fn bad_gateway_body(e: &TunnelError) -> &'static str {
    match e {
        TunnelError::Backend { phase, .. } => match phase {
            BackendPhase::OpenFailed => "bad gateway: open failed",
            BackendPhase::WriteFailed => "bad gateway: write failed",
            BackendPhase::ResponseParseFailed => "bad gateway: response parse failed",
        },
        TunnelError::Tls(_) => "bad gateway: tls handshake failed",
        _ => "bad gateway",
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

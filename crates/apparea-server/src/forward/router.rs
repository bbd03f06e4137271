//! Shared HTTP surface routing requests to forwarders by `Host`.
//!
//! The surface is bound when the first hostname registers and torn down when
//! the last one leaves.

use super::http::HttpForwarder;
use apparea_core::{TunnelError, TunnelResult};
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST};
use http::{Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Body type of every response leaving the surface.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// hyper refuses read buffers smaller than this.
const MIN_BUF_SIZE: usize = 8192;

/// Settings for the shared HTTP listening surface.
#[derive(Debug, Clone)]
pub struct HttpSurfaceConfig {
    /// Bind address of the shared surface.
    pub listen: String,
    /// Deadline for reading request headers.
    pub read_timeout: Duration,
    /// Deadline for producing a response.
    pub write_timeout: Duration,
    /// Upper bound on buffered request headers, in bytes.
    pub max_header_size: usize,
}

/// Hostname registry plus the lazily bound surface serving it.
pub struct VirtualHostRouter {
    config: HttpSurfaceConfig,
    /// Registry and surface, under one lock.
    state: Mutex<RouterState>,
}

#[derive(Default)]
struct RouterState {
    /// Lowercased hostname to owning forwarder.
    hosts: HashMap<String, Arc<HttpForwarder>>,
    /// Present while at least one host is registered.
    surface: Option<Surface>,
}

struct Surface {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Surface {
    /// Stop accepting and release the socket before returning.
    async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
        info!(addr = %self.local_addr, "http surface stopped");
    }
}

impl VirtualHostRouter {
    pub fn new(config: HttpSurfaceConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(RouterState::default()),
        })
    }

    pub fn config(&self) -> &HttpSurfaceConfig {
        &self.config
    }

    /// Claim `hostname` for `forwarder`, binding the surface if needed.
    pub async fn register(
        self: &Arc<Self>,
        hostname: &str,
        forwarder: Arc<HttpForwarder>,
    ) -> TunnelResult<SocketAddr> {
        let key = hostname.to_ascii_lowercase();
        let mut state = self.state.lock().await;
        if state.hosts.contains_key(&key) {
            return Err(TunnelError::HostnameInUse(hostname.to_string()));
        }
        let local_addr = match &state.surface {
            Some(surface) => surface.local_addr,
            None => {
                let surface = self.bind_surface().await?;
                let addr = surface.local_addr;
                state.surface = Some(surface);
                addr
            }
        };
        state.hosts.insert(key, forwarder);
        debug!(hostname, hosts = state.hosts.len(), "virtual host registered");
        Ok(local_addr)
    }

    /// Release `hostname` if it is still held by `forwarder`. Returns whether
    /// anything was removed.
    pub async fn unregister(&self, hostname: &str, forwarder: &Arc<HttpForwarder>) -> bool {
        let key = hostname.to_ascii_lowercase();
        let mut state = self.state.lock().await;
        match state.hosts.get(&key) {
            Some(existing) if Arc::ptr_eq(existing, forwarder) => {}
            _ => return false,
        }
        state.hosts.remove(&key);
        debug!(hostname, hosts = state.hosts.len(), "virtual host removed");
        if state.hosts.is_empty() {
            if let Some(surface) = state.surface.take() {
                surface.stop().await;
            }
        }
        true
    }

    pub async fn lookup(&self, hostname: &str) -> Option<Arc<HttpForwarder>> {
        let state = self.state.lock().await;
        state.hosts.get(&hostname.to_ascii_lowercase()).cloned()
    }

    /// Address of the surface, if bound.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.surface.as_ref().map(|s| s.local_addr)
    }

    pub async fn host_count(&self) -> usize {
        self.state.lock().await.hosts.len()
    }

    /// Route one request from the surface.
    pub async fn dispatch(&self, req: Request<Incoming>, remote: SocketAddr) -> Response<ProxyBody> {
        let forwarder = match request_host(&req) {
            Some(host) => self.lookup(&host).await,
            None => None,
        };
        match forwarder {
            Some(forwarder) => forwarder.handle(req, remote).await,
            None => {
                debug!(%remote, uri = %req.uri(), "no site for request");
                text_response(StatusCode::NOT_FOUND, "site not found")
            }
        }
    }

    async fn bind_surface(self: &Arc<Self>) -> TunnelResult<Surface> {
        let listener = TcpListener::bind(self.config.listen.as_str())
            .await
            .map_err(|source| TunnelError::Bind {
                address: self.config.listen.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "http surface listening");
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::downgrade(self),
            self.config.clone(),
        ));
        Ok(Surface { local_addr, task })
    }
}

async fn accept_loop(
    listener: TcpListener,
    router: Weak<VirtualHostRouter>,
    config: HttpSurfaceConfig,
) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "http surface accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let Some(router) = router.upgrade() else {
            break;
        };

        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .header_read_timeout(config.read_timeout)
            .max_buf_size(config.max_header_size.max(MIN_BUF_SIZE));

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let router = router.clone();
                async move { Ok::<_, Infallible>(router.dispatch(req, remote).await) }
            });
            if let Err(e) = builder.serve_connection(TokioIo::new(stream), service).await {
                debug!(%remote, error = %e, "http connection ended with error");
            }
        });
    }
}

/// Lowercased host from the `Host` header (or an absolute-form URI), with
/// any port removed.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    let authority = match req.headers().get(HOST) {
        Some(value) => value.to_str().ok()?.parse::<http::uri::Authority>().ok()?,
        None => req.uri().authority()?.clone(),
    };
    Some(authority.host().to_ascii_lowercase())
}

pub(crate) fn text_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let mut resp = Response::new(
        Full::new(Bytes::from_static(body.as_bytes()))
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

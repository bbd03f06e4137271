//! Raw TCP forwarding: one public listener per request, every accepted
//! connection relayed over its own `forwarded-tcpip` sub-channel.

use super::relay::spawn_relay;
use super::StatusLog;
use apparea_core::transport::PeerHandle;
use apparea_core::{ForwardRequest, ForwardedTcpip, TunnelError, TunnelResult, FORWARDED_TCPIP};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub struct RawForwarder {
    /// Requested bind address; the port is rewritten once assigned.
    request: ForwardRequest,
    /// Base hostname used when reporting the listener to the user.
    public_host: String,
    /// Peer that receives a `forwarded-tcpip` channel per connection.
    peer: Arc<dyn PeerHandle>,
    /// Session status sink for user-visible failures.
    log: StatusLog,
    /// Set by the first `close`.
    closed: Arc<AtomicBool>,
    /// Flipped to `true` on close; observed by the accept loop and relays.
    shutdown: watch::Sender<bool>,
    /// Bound listener address, `None` until `serve` succeeds.
    local_addr: Option<SocketAddr>,
    /// Accept loop owning the listener; awaited on close.
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl RawForwarder {
    /// `public_host` is the name shown to users in the listener address.
    pub fn new(
        request: ForwardRequest,
        public_host: impl Into<String>,
        peer: Arc<dyn PeerHandle>,
        log: StatusLog,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            request,
            public_host: public_host.into(),
            peer,
            log,
            closed: Arc::new(AtomicBool::new(false)),
            shutdown,
            local_addr: None,
            accept_task: Mutex::new(None),
        }
    }

    pub fn request(&self) -> &ForwardRequest {
        &self.request
    }

    /// Bind the public listener and start accepting.
    ///
    /// An empty or `*` host binds every interface. With port 0 the assigned
    /// port is written back into the request.
    pub async fn serve(&mut self) -> TunnelResult<()> {
        if self.local_addr.is_some() || self.closed.load(Ordering::Acquire) {
            return Err(TunnelError::Other("forwarder already served".into()));
        }
        let port = u16::try_from(self.request.port)
            .map_err(|_| TunnelError::InvalidPort(self.request.port))?;
        let host = match self.request.host.as_str() {
            "" | "*" => "0.0.0.0",
            h => h,
        };
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|source| TunnelError::Bind {
                address: self.request.address(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        self.request.port = u32::from(local_addr.port());
        self.local_addr = Some(local_addr);

        info!(
            user = self.peer.user(),
            addr = %local_addr,
            public = %format!("{}:{}", self.public_host, local_addr.port()),
            "raw forwarder listening"
        );

        let accept = AcceptLoop {
            listener,
            request: self.request.clone(),
            peer: self.peer.clone(),
            log: self.log.clone(),
            closed: self.closed.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        let task = tokio::spawn(accept.run());
        if let Ok(slot) = self.accept_task.get_mut() {
            *slot = Some(task);
        }
        Ok(())
    }

    /// Stop accepting and close every in-flight relay. Idempotent.
    ///
    /// Returns once the accept loop has exited, so the listening port is
    /// free again.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(port = self.request.port, "closing raw forwarder");
        }
        self.shutdown.send_replace(true);
        let task = self.accept_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(port = self.request.port, error = %e, "raw accept loop panicked");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn listener_address(&self) -> Option<String> {
        self.local_addr
            .map(|addr| format!("{}:{}", self.public_host, addr.port()))
    }

    pub fn listener_port(&self) -> Option<u32> {
        self.local_addr.map(|addr| u32::from(addr.port()))
    }
}

struct AcceptLoop {
    listener: TcpListener,
    request: ForwardRequest,
    peer: Arc<dyn PeerHandle>,
    log: StatusLog,
    closed: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
}

impl AcceptLoop {
    async fn run(mut self) {
        let port = self.request.port;
        while !self.closed.load(Ordering::Acquire) {
            let accepted = tokio::select! {
                res = self.listener.accept() => res,
                _ = self.shutdown.wait_for(|s| *s) => break,
            };
            match accepted {
                Ok((socket, origin)) => {
                    if !self.forward(socket, origin).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(port, error = %e, "could not accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        debug!(port, "raw accept loop stopped");
    }

    /// Open the sub-channel for one connection and start relaying. Returns
    /// `false` once the forwarder has been closed.
    async fn forward(&mut self, socket: TcpStream, origin: SocketAddr) -> bool {
        let payload = ForwardedTcpip {
            host: self.request.host.clone(),
            port: self.request.port,
            originator_address: origin.ip().to_string(),
            originator_port: u32::from(origin.port()),
        }
        .encode();

        let opened = tokio::select! {
            res = self.peer.open_channel(FORWARDED_TCPIP, payload) => res,
            _ = self.shutdown.wait_for(|s| *s) => return false,
        };
        match opened {
            Ok(channel) => {
                debug!(%origin, port = self.request.port, "relaying raw connection");
                spawn_relay(socket, channel, self.shutdown.clone(), origin);
            }
            Err(e) => {
                warn!(%origin, error = %e, "could not open remote connection");
                self.log.post(format!("Could not open remote connection: {e}"));
            }
        }
        true
    }
}

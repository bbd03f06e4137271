//! Core server: accepts peers and runs one session per authenticated peer.
//!
//! Each session has a request loop (`tcpip-forward` → forwarder) and a
//! channel loop (`session` channels → status views). Either loop ending
//! closes the session.

use crate::config::ServerConfig;
use crate::forward::{tls, Forwarder, HttpForwarder, RawForwarder, VirtualHostRouter};
use crate::session::{Session, StatusView, View};
use apparea_core::codec::encode_port_reply;
use apparea_core::transport::{
    Acceptor, ChannelRequest, GlobalRequest, NewChannel, OpenedChannel, PeerConnection,
    PeerHandle, RejectReason,
};
use apparea_core::{
    virtual_hostname, ForwardRequest, TunnelError, TunnelResult, UserDirectory, TCPIP_FORWARD,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Channel type a peer opens to watch its status console.
pub const SESSION_CHANNEL: &str = "session";

const INTAKE_DEPTH: usize = 16;

pub struct TunnelServer {
    config: ServerConfig,
    /// Resolves logins to principals for HTTP site claims.
    users: Arc<dyn UserDirectory>,
    /// Shared virtual-host surface for every session.
    router: Arc<VirtualHostRouter>,
    /// Client config for HTTPS backends.
    tls: Arc<rustls::ClientConfig>,
}

impl TunnelServer {
    pub fn new(config: ServerConfig, users: Arc<dyn UserDirectory>) -> TunnelResult<Self> {
        let router = VirtualHostRouter::new(config.http.clone());
        let tls = tls::client_config()?;
        Ok(Self {
            config,
            users,
            router,
            tls,
        })
    }

    pub fn router(&self) -> &Arc<VirtualHostRouter> {
        &self.router
    }

    /// Accept peers until the acceptor is exhausted. Each handshake runs in
    /// its own task.
    pub async fn run<A>(self: Arc<Self>, mut acceptor: A) -> TunnelResult<()>
    where
        A: Acceptor + 'static,
    {
        info!(
            hostname = %self.config.hostname,
            http = %self.config.http.listen,
            "apparea server ready"
        );
        loop {
            let incoming = match acceptor.accept().await {
                Ok(Some(incoming)) => incoming,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            let srv = self.clone();
            tokio::spawn(async move {
                let remote = incoming.remote_addr;
                match incoming.handshake.await {
                    Ok(conn) => srv.launch_session(conn).await,
                    Err(e) => warn!(%remote, error = %e, "handshake failed"),
                }
            });
        }
        info!("acceptor closed, no longer accepting peers");
        Ok(())
    }

    /// Drive one authenticated peer until it disconnects.
    pub async fn launch_session(self: Arc<Self>, conn: PeerConnection) {
        let PeerConnection {
            handle,
            mut requests,
            mut channels,
        } = conn;
        let (view_tx, view_rx) = mpsc::channel(INTAKE_DEPTH);
        let (fwd_tx, fwd_rx) = mpsc::channel(INTAKE_DEPTH);
        let session = Session::spawn(handle.user(), view_rx, fwd_rx);
        info!(
            session_id = %session.id,
            user = handle.user(),
            remote = %handle.remote_addr(),
            "peer connected"
        );

        let request_loop = {
            let session = session.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                while let Some(req) = requests.recv().await {
                    self.handle_request(req, &handle, &session, &fwd_tx).await;
                }
                session.close().await;
            })
        };

        let channel_loop = {
            let session = session.clone();
            tokio::spawn(async move {
                while let Some(channel) = channels.recv().await {
                    handle_channel(channel, &view_tx).await;
                }
                session.close().await;
            })
        };

        let _ = tokio::join!(request_loop, channel_loop);
        debug!(session_id = %session.id, "peer disconnected");
    }

    async fn handle_request(
        &self,
        req: GlobalRequest,
        handle: &Arc<dyn PeerHandle>,
        session: &Arc<Session>,
        forwarders: &mpsc::Sender<Forwarder>,
    ) {
        if req.request_type != TCPIP_FORWARD {
            debug!(request_type = %req.request_type, "refusing unknown request");
            req.reply(false, Vec::new());
            return;
        }

        if session.is_closed() {
            debug!(session_id = %session.id, "refusing forward on closed session");
            req.reply(false, Vec::new());
            return;
        }

        match self.establish(&req.payload, handle, session).await {
            Ok(forwarder) if session.is_closed() => {
                forwarder.close().await;
                req.reply(false, Vec::new());
            }
            Ok(forwarder) => {
                let reply = match &forwarder {
                    Forwarder::Raw(raw) => raw.listener_port().map(encode_port_reply),
                    Forwarder::Http(_) => None,
                };
                req.reply(true, reply.unwrap_or_default());
                if let Err(mpsc::error::SendError(forwarder)) = forwarders.send(forwarder).await {
                    forwarder.close().await;
                }
            }
            Err(e) => {
                if e.is_protocol() {
                    debug!(user = handle.user(), error = %e, "malformed forward request");
                } else {
                    warn!(user = handle.user(), error = %e, "could not establish forwarding");
                }
                req.reply(false, Vec::new());
                session
                    .broadcast(&format!("Could not establish forwarding: {e}"))
                    .await;
            }
        }
    }

    /// Parse a forward request, build the matching forwarder and serve it.
    async fn establish(
        &self,
        payload: &[u8],
        handle: &Arc<dyn PeerHandle>,
        session: &Session,
    ) -> TunnelResult<Forwarder> {
        let request = ForwardRequest::parse(payload)?;
        let log = session.status_log();
        let mut forwarder = match request.port {
            80 | 443 => {
                let principal = self
                    .users
                    .lookup_user(handle.user())
                    .ok_or_else(|| TunnelError::UnknownUser(handle.user().to_string()))?;
                let hostname = virtual_hostname(
                    &principal.name,
                    &principal.subdomain,
                    &self.config.hostname,
                );
                let forwarder = if request.port == 80 {
                    HttpForwarder::http(request, hostname, handle.clone(), self.router.clone(), log)
                } else {
                    HttpForwarder::https(
                        request,
                        hostname,
                        handle.clone(),
                        self.router.clone(),
                        self.tls.clone(),
                        log,
                    )
                };
                Forwarder::Http(forwarder)
            }
            0 => Forwarder::Raw(RawForwarder::new(
                request,
                self.config.hostname.clone(),
                handle.clone(),
                log,
            )),
            port => return Err(TunnelError::InvalidPort(port)),
        };
        forwarder.serve().await?;
        Ok(forwarder)
    }
}

async fn handle_channel(channel: NewChannel, views: &mpsc::Sender<Arc<dyn View>>) {
    if channel.channel_type != SESSION_CHANNEL {
        let message = format!("unsupported channel type: {}", channel.channel_type);
        debug!(channel_type = %channel.channel_type, "rejecting channel");
        channel.reject(RejectReason::UnknownChannelType, message);
        return;
    }
    match channel.accept().await {
        Ok(OpenedChannel { stream, requests }) => {
            tokio::spawn(acknowledge_requests(requests));
            let view: Arc<dyn View> = Arc::new(StatusView::new(stream));
            let _ = views.send(view).await;
        }
        Err(e) => warn!(error = %e, "could not accept session channel"),
    }
}

/// A bare `shell` is the only in-channel request a status console accepts.
async fn acknowledge_requests(mut requests: mpsc::Receiver<ChannelRequest>) {
    while let Some(req) = requests.recv().await {
        let ok = req.request_type == "shell" && req.payload.is_empty();
        req.reply(ok);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::HttpSurfaceConfig;
    use apparea_core::transport::memory::{self, ClientChannel, MemoryClient, MemoryDialer};
    use apparea_core::AuthorizedUsers;
    use std::net::SocketAddr;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn config() -> ServerConfig {
        ServerConfig {
            hostname: "apparea.dev".into(),
            listen: "127.0.0.1:0".into(),
            authorized_keys: "/dev/null".into(),
            http: HttpSurfaceConfig {
                listen: "127.0.0.1:0".into(),
                read_timeout: Duration::from_secs(5),
                write_timeout: Duration::from_secs(5),
                max_header_size: 1 << 20,
            },
        }
    }

    fn peer_addr() -> SocketAddr {
        "10.0.0.7:50000".parse().unwrap()
    }

    fn start() -> (Arc<TunnelServer>, MemoryDialer) {
        let users = AuthorizedUsers::parse("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIA== alice\n");
        let server = Arc::new(TunnelServer::new(config(), Arc::new(users)).unwrap());
        let (dialer, acceptor) = memory::listener();
        tokio::spawn(server.clone().run(acceptor));
        (server, dialer)
    }

    async fn forward(client: &MemoryClient, host: &str, port: u32) -> (bool, Vec<u8>) {
        let payload = ForwardRequest::new(host, port).encode();
        let reply = client
            .request(TCPIP_FORWARD, true, payload)
            .await
            .unwrap()
            .unwrap();
        (reply.ok, reply.payload)
    }

    async fn read_until(chan: &mut ClientChannel, needle: &str) -> String {
        let mut out = String::new();
        let mut buf = [0u8; 256];
        tokio::time::timeout(Duration::from_secs(2), async {
            while !out.contains(needle) {
                let n = chan.stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "console closed before {needle:?}; got {out:?}");
                out.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
        })
        .await
        .unwrap();
        out
    }

    #[tokio::test]
    async fn raw_forward_replies_with_port_and_announces() {
        let (_server, dialer) = start();
        let client = dialer.dial("alice", peer_addr()).await.unwrap();
        let mut console = client.open_channel(SESSION_CHANNEL, vec![]).await.unwrap();

        let (ok, payload) = forward(&client, "127.0.0.1", 0).await;
        assert!(ok);
        assert_eq!(payload.len(), 4);
        let port = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert_ne!(port, 0);

        let out = read_until(&mut console, &format!("apparea.dev:{port}")).await;
        assert!(out.contains(&format!(">>> listening on apparea.dev:{port}\r\n")));
        assert!(TcpStream::connect(("127.0.0.1", port as u16)).await.is_ok());
    }

    #[tokio::test]
    async fn bad_requests_fail_and_are_reported() {
        let (_server, dialer) = start();
        let client = dialer.dial("alice", peer_addr()).await.unwrap();

        assert_eq!(forward(&client, "127.0.0.1", 22).await, (false, vec![]));

        let mut malformed = ForwardRequest::new("127.0.0.1", 0).encode();
        malformed.push(7);
        let reply = client.request(TCPIP_FORWARD, true, malformed).await.unwrap().unwrap();
        assert!(!reply.ok);

        let reply = client.request("cancel-tcpip-forward", true, vec![]).await.unwrap().unwrap();
        assert!(!reply.ok);
        assert!(client.request("keepalive", false, vec![]).await.unwrap().is_none());

        // History is replayed into a console opened afterwards.
        let mut console = client.open_channel(SESSION_CHANNEL, vec![]).await.unwrap();
        let out = read_until(&mut console, "trailing data").await;
        assert!(out.contains(">>> Could not establish forwarding: forward request invalid port: 22"));
    }

    #[tokio::test]
    async fn http_forward_claims_subdomain_and_disconnect_releases_it() {
        let (server, dialer) = start();
        let client = dialer.dial("alice.dev.blog", peer_addr()).await.unwrap();

        assert_eq!(forward(&client, "localhost", 80).await, (true, vec![]));
        let router = server.router().clone();
        assert!(router.lookup("blog-dev-alice.apparea.dev").await.is_some());

        // Same site from a second connection is refused.
        let other = dialer.dial("alice.dev.blog", peer_addr()).await.unwrap();
        assert_eq!(forward(&other, "localhost", 443).await, (false, vec![]));

        drop(client);
        let mut released = false;
        for _ in 0..100 {
            if router.lookup("blog-dev-alice.apparea.dev").await.is_none() {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released);
    }

    #[tokio::test]
    async fn unknown_user_cannot_claim_site() {
        let (server, dialer) = start();
        let client = dialer.dial("mallory", peer_addr()).await.unwrap();
        assert_eq!(forward(&client, "localhost", 80).await, (false, vec![]));
        assert_eq!(server.router().host_count().await, 0);
    }

    #[tokio::test]
    async fn session_channel_acks_bare_shell_only() {
        let (_server, dialer) = start();
        let client = dialer.dial("alice", peer_addr()).await.unwrap();

        let console = client.open_channel(SESSION_CHANNEL, vec![]).await.unwrap();
        assert_eq!(console.request("shell", true, vec![]).await.unwrap(), Some(true));
        assert_eq!(console.request("shell", true, vec![1]).await.unwrap(), Some(false));
        assert_eq!(console.request("pty-req", true, vec![]).await.unwrap(), Some(false));
        assert_eq!(console.request("env", false, vec![]).await.unwrap(), None);

        let err = client.open_channel("direct-tcpip", vec![]).await.err().unwrap();
        assert!(err.to_string().contains("unknown channel type"));
    }

    #[tokio::test]
    async fn forwards_refused_once_session_closed() {
        let users = AuthorizedUsers::parse("");
        let server = Arc::new(TunnelServer::new(config(), Arc::new(users)).unwrap());
        let (client, mut conn) = memory::connect("alice", peer_addr());
        // Channel side already gone: the session closes straight away.
        let (_, ended) = mpsc::channel(1);
        conn.channels = ended;
        tokio::spawn(server.launch_session(conn));

        let mut refused = None;
        for _ in 0..50 {
            let (ok, payload) = forward(&client, "127.0.0.1", 0).await;
            if !ok {
                refused = Some(payload);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(refused, Some(vec![]));

        // Every later request is refused too.
        assert_eq!(forward(&client, "127.0.0.1", 0).await, (false, vec![]));
    }

    #[tokio::test]
    async fn failed_handshake_does_not_stop_accepting() {
        let (_server, dialer) = start();
        dialer.dial_failing(peer_addr(), "bad key").await.unwrap();
        let client = dialer.dial("alice", peer_addr()).await.unwrap();
        assert!(forward(&client, "127.0.0.1", 0).await.0);
    }
}

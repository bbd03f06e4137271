//! Per-peer session: the views watching it, the forwarders it owns, and the
//! history of everything broadcast so far.
//!
//! Views and forwarders arrive on two intake queues. Closing the session
//! closes every forwarder exactly once, however many parties ask.

use super::view::View;
use crate::forward::{Forwarder, StatusLog};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

pub struct Session {
    /// Random hex identifier, used in logs.
    pub id: String,
    /// Authenticated login of the peer.
    pub user: String,
    /// Views, forwarders and history behind one lock.
    state: Mutex<SessionState>,
    /// Set by the first `close`.
    closed: AtomicBool,
    /// Feeds the status-log drain task.
    log_tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct SessionState {
    /// Consoles currently attached.
    views: Vec<Arc<dyn View>>,
    /// Served forwarders, closed with the session.
    forwarders: Vec<Forwarder>,
    /// Every broadcast so far, replayed to late views.
    history: Vec<String>,
}

impl SessionState {
    fn broadcast(&mut self, msg: &str) {
        self.history.push(msg.to_string());
        for view in &self.views {
            if let Err(e) = view.send(msg) {
                debug!(error = %e, "view dropped a message");
            }
        }
    }
}

impl Session {
    /// Create a session and start draining both intake queues and the status
    /// log into it.
    pub fn spawn(
        user: impl Into<String>,
        mut views: mpsc::Receiver<Arc<dyn View>>,
        mut forwarders: mpsc::Receiver<Forwarder>,
    ) -> Arc<Self> {
        let (log_tx, mut log_rx) = mpsc::unbounded_channel::<String>();
        let session = Arc::new(Self {
            id: hex::encode(rand::random::<[u8; 8]>()),
            user: user.into(),
            state: Mutex::new(SessionState::default()),
            closed: AtomicBool::new(false),
            log_tx,
        });
        info!(session_id = %session.id, user = %session.user, "session started");

        let s = session.clone();
        tokio::spawn(async move {
            while let Some(view) = views.recv().await {
                s.add_view(view).await;
            }
        });

        let s = session.clone();
        tokio::spawn(async move {
            while let Some(forwarder) = forwarders.recv().await {
                s.add_forwarder(forwarder).await;
            }
        });

        let weak: Weak<Self> = Arc::downgrade(&session);
        tokio::spawn(async move {
            while let Some(msg) = log_rx.recv().await {
                let Some(s) = weak.upgrade() else { break };
                s.broadcast(&msg).await;
            }
        });

        session
    }

    /// Sink forwarders post their status lines to.
    pub fn status_log(&self) -> StatusLog {
        StatusLog::new(self.log_tx.clone())
    }

    /// Register a view and replay the history into it.
    pub async fn add_view(&self, view: Arc<dyn View>) {
        let mut state = self.state.lock().await;
        if self.is_closed() {
            return;
        }
        for msg in &state.history {
            if view.send(msg).is_err() {
                return;
            }
        }
        state.views.push(view);
    }

    /// Take ownership of a served forwarder and announce it.
    pub async fn add_forwarder(&self, forwarder: Forwarder) {
        let mut state = self.state.lock().await;
        if self.is_closed() {
            drop(state);
            forwarder.close().await;
            return;
        }
        let address = forwarder
            .listener_address()
            .unwrap_or_else(|| forwarder.request().address());
        state.forwarders.push(forwarder);
        state.broadcast(&format!("listening on {address}"));
    }

    /// Append to the history and show to every view.
    pub async fn broadcast(&self, msg: &str) {
        self.state.lock().await.broadcast(msg);
    }

    /// Close every forwarder and drop every view. Only the first call does
    /// anything; it returns `true`.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut state = self.state.lock().await;
        let forwarders = std::mem::take(&mut state.forwarders);
        for forwarder in &forwarders {
            forwarder.close().await;
        }
        state.views.clear();
        info!(
            session_id = %self.id,
            user = %self.user,
            forwarders = forwarders.len(),
            "session closed"
        );
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn history(&self) -> Vec<String> {
        self.state.lock().await.history.clone()
    }

    pub async fn view_count(&self) -> usize {
        self.state.lock().await.views.len()
    }

    pub async fn forwarder_count(&self) -> usize {
        self.state.lock().await.forwarders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::RawForwarder;
    use apparea_core::transport::memory;
    use apparea_core::{ForwardRequest, TunnelResult};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    #[derive(Default)]
    struct RecordingView {
        seen: std::sync::Mutex<Vec<String>>,
    }

    impl View for RecordingView {
        fn send(&self, msg: &str) -> TunnelResult<()> {
            self.seen.lock().unwrap().push(msg.to_string());
            Ok(())
        }
    }

    impl RecordingView {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    fn intake() -> (
        Arc<Session>,
        mpsc::Sender<Arc<dyn View>>,
        mpsc::Sender<Forwarder>,
    ) {
        let (view_tx, view_rx) = mpsc::channel(4);
        let (fwd_tx, fwd_rx) = mpsc::channel(4);
        (Session::spawn("alice", view_rx, fwd_rx), view_tx, fwd_tx)
    }

    fn peer_addr() -> SocketAddr {
        "10.0.0.7:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn late_view_sees_history_in_order() {
        let (session, view_tx, _fwd_tx) = intake();
        session.broadcast("one").await;
        session.broadcast("two").await;
        session.status_log().post("three");

        // Let the log drain task deliver.
        for _ in 0..50 {
            if session.history().await.len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let view = Arc::new(RecordingView::default());
        view_tx.send(view.clone()).await.unwrap();
        for _ in 0..50 {
            if session.view_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        session.broadcast("four").await;
        assert_eq!(view.seen(), vec!["one", "two", "three", "four"]);
    }

    #[tokio::test]
    async fn close_shuts_every_forwarder_once() {
        let (session, _view_tx, _fwd_tx) = intake();
        let (mut client, conn) = memory::connect("alice", peer_addr());

        let mut ports = Vec::new();
        for _ in 0..2 {
            let mut raw = RawForwarder::new(
                ForwardRequest::new("127.0.0.1", 0),
                "apparea.dev",
                conn.handle.clone(),
                session.status_log(),
            );
            raw.serve().await.unwrap();
            ports.push(raw.listener_port().unwrap() as u16);
            session.add_forwarder(Forwarder::Raw(raw)).await;
        }
        assert_eq!(session.forwarder_count().await, 2);
        assert!(session.history().await[0].starts_with("listening on apparea.dev:"));

        // One in-flight relay per forwarder.
        let mut publics = Vec::new();
        let mut backends = Vec::new();
        for port in &ports {
            publics.push(TcpStream::connect(("127.0.0.1", *port)).await.unwrap());
            backends.push(client.next_reverse().await.unwrap().accept());
        }

        let (a, b) = tokio::join!(session.close(), session.close());
        assert!(a ^ b);
        assert!(!session.close().await);
        assert_eq!(session.forwarder_count().await, 0);

        let mut sink = Vec::new();
        for public in &mut publics {
            tokio::time::timeout(Duration::from_secs(2), public.read_to_end(&mut sink))
                .await
                .unwrap()
                .unwrap();
        }
        for backend in &mut backends {
            tokio::time::timeout(Duration::from_secs(2), backend.read_to_end(&mut sink))
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn forwarder_after_close_is_closed() {
        let (session, _view_tx, fwd_tx) = intake();
        session.close().await;

        let (_client, conn) = memory::connect("alice", peer_addr());
        let mut raw = RawForwarder::new(
            ForwardRequest::new("127.0.0.1", 0),
            "apparea.dev",
            conn.handle,
            StatusLog::discard(),
        );
        raw.serve().await.unwrap();
        let port = raw.listener_port().unwrap() as u16;
        fwd_tx.send(Forwarder::Raw(raw)).await.unwrap();

        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(refused);
        assert_eq!(session.forwarder_count().await, 0);
    }
}

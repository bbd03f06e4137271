//! Bidirectional byte relay between a public connection and a sub-channel.

use apparea_core::transport::OpenedChannel;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Exactly-once close signal shared by the halves of a relay.
#[derive(Clone)]
pub struct CloseCoordinator {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CloseCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseCoordinator {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Only the first caller gets `true`.
    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|closed| !std::mem::replace(closed, true))
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Pump bytes between `public` and `channel` until either side finishes or
/// `shutdown` turns true. Both ends are shut down together.
///
/// In-channel requests arriving on the sub-channel are refused for as long as
/// the relay runs.
pub fn spawn_relay<S>(
    public: S,
    channel: OpenedChannel,
    mut shutdown: watch::Receiver<bool>,
    origin: SocketAddr,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let OpenedChannel {
        stream,
        mut requests,
    } = channel;

    let discard = tokio::spawn(async move {
        while let Some(req) = requests.recv().await {
            req.reply(false);
        }
    });

    let coord = CloseCoordinator::new();
    let (public_r, public_w) = tokio::io::split(public);
    let (chan_r, chan_w) = tokio::io::split(stream);
    let upstream = tokio::spawn(pump(public_r, chan_w, coord.clone(), origin, "upstream"));
    let downstream = tokio::spawn(pump(chan_r, public_w, coord.clone(), origin, "downstream"));

    tokio::spawn(async move {
        tokio::select! {
            _ = coord.closed() => {}
            Ok(_) = shutdown.wait_for(|s| *s) => {
                coord.close();
            }
        }
        let _ = upstream.await;
        let _ = downstream.await;
        discard.abort();
        debug!(%origin, "relay closed");
    })
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    coord: CloseCoordinator,
    origin: SocketAddr,
    direction: &'static str,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = tokio::select! {
        res = tokio::io::copy(&mut reader, &mut writer) => Some(res),
        _ = coord.closed() => None,
    };
    coord.close();
    let _ = writer.shutdown().await;

    match result {
        Some(Ok(bytes)) => debug!(%origin, direction, bytes, "relay half finished"),
        Some(Err(e)) => warn!(%origin, direction, error = %e, "relay copy failed"),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apparea_core::transport::ChannelRequest;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::sync::mpsc;

    fn origin() -> SocketAddr {
        "127.0.0.1:5555".parse().unwrap()
    }

    #[tokio::test]
    async fn coordinator_fires_once_under_contention() {
        let coord = CloseCoordinator::new();
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let c = coord.clone();
            tasks.push(tokio::spawn(async move { c.close() }));
        }
        let mut winners = 0;
        for t in tasks {
            if t.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(coord.is_closed());
        coord.closed().await;
    }

    #[tokio::test]
    async fn closing_one_side_closes_both() {
        let (public_inner, mut public) = duplex(1024);
        let (chan_inner, mut chan) = duplex(1024);
        let (_req_tx, req_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let relay = spawn_relay(
            public_inner,
            OpenedChannel {
                stream: Box::new(chan_inner),
                requests: req_rx,
            },
            shutdown_rx,
            origin(),
        );

        public.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        chan.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        chan.write_all(b"pong").await.unwrap();
        public.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(public);
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), chan.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
        tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_signal_closes_relay_and_refuses_requests() {
        let (public_inner, mut public) = duplex(1024);
        let (chan_inner, mut chan) = duplex(1024);
        let (req_tx, req_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let relay = spawn_relay(
            public_inner,
            OpenedChannel {
                stream: Box::new(chan_inner),
                requests: req_rx,
            },
            shutdown_rx,
            origin(),
        );

        let (req, reply) = ChannelRequest::new("exec", true, vec![]);
        req_tx.send(req).await.unwrap();
        assert!(!reply.unwrap().await.unwrap());

        shutdown_tx.send_replace(true);
        let mut sink = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), public.read_to_end(&mut sink))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), chan.read_to_end(&mut sink))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .unwrap()
            .unwrap();
    }
}

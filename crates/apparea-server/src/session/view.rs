//! Views: sinks for a session's status messages.

use apparea_core::transport::ChannelStream;
use apparea_core::{TunnelError, TunnelResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

/// Something that can display a status message to the peer.
pub trait View: Send + Sync {
    fn send(&self, msg: &str) -> TunnelResult<()>;
}

/// Status console on an accepted `session` channel. Each message is written
/// as a `>>> msg` line; anything the peer types is ignored.
pub struct StatusView {
    tx: mpsc::UnboundedSender<String>,
}

impl StatusView {
    /// Take over `stream`. The channel closes when the view is dropped.
    pub fn new(stream: ChannelStream) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let (mut reader, mut writer) = tokio::io::split(stream);

        let drain = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok(n) = reader.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let line = format!(">>> {msg}\r\n");
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    debug!(error = %e, "status view write failed");
                    break;
                }
            }
            let _ = writer.shutdown().await;
            drain.abort();
        });

        Self { tx }
    }
}

impl View for StatusView {
    fn send(&self, msg: &str) -> TunnelResult<()> {
        self.tx
            .send(msg.to_string())
            .map_err(|_| TunnelError::Relay("status view closed".into()))
    }
}

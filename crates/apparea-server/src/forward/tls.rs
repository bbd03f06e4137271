//! TLS client sessions carried over a sub-channel.
//!
//! The handshake runs over one end of an in-memory pipe; two copy tasks move
//! ciphertext between the other end and the channel.

use apparea_core::transport::ChannelStream;
use apparea_core::{TunnelError, TunnelResult};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Client config for backend TLS. Backends are the peer's own local
/// services, so certificates are not verified.
pub fn client_config() -> TunnelResult<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TunnelError::Tls(format!("TLS config error: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification { provider }))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// A TLS session whose records travel over a sub-channel.
pub struct TlsBridge {
    tls: TlsStream<DuplexStream>,
    pumps: [JoinHandle<()>; 2],
}

impl TlsBridge {
    pub async fn connect(
        channel: ChannelStream,
        host: &str,
        config: Arc<ClientConfig>,
    ) -> TunnelResult<Self> {
        let (tls_io, relay_io) = tokio::io::duplex(PIPE_CAPACITY);
        let (chan_r, chan_w) = tokio::io::split(channel);
        let (pipe_r, pipe_w) = tokio::io::split(relay_io);
        let pumps = [
            tokio::spawn(copy_half(chan_r, pipe_w, "channel to pipe")),
            tokio::spawn(copy_half(pipe_r, chan_w, "pipe to channel")),
        ];

        let connector = TlsConnector::from(config);
        match connector.connect(server_name(host), tls_io).await {
            Ok(tls) => Ok(Self { tls, pumps }),
            Err(e) => {
                for pump in &pumps {
                    pump.abort();
                }
                Err(TunnelError::Tls(format!("handshake failed: {e}")))
            }
        }
    }

    /// Send close_notify and stop relaying. Errors are ignored.
    pub async fn close(mut self) {
        let _ = self.tls.shutdown().await;
    }
}

impl Drop for TlsBridge {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

impl AsyncRead for TlsBridge {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().tls).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsBridge {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().tls).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().tls).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().tls).poll_shutdown(cx)
    }
}

async fn copy_half<R, W>(mut reader: R, mut writer: W, direction: &'static str)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => debug!(direction, bytes, "tls pump finished"),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {}
        Err(e) => warn!(direction, error = %e, "tls pump copy failed"),
    }
    let _ = writer.shutdown().await;
}

/// SNI name for the backend. Empty or unparseable hosts fall back to the
/// loopback address, which sends no SNI.
fn server_name(host: &str) -> ServerName<'static> {
    ServerName::try_from(host.to_string())
        .unwrap_or_else(|_| ServerName::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST).into()))
}

#[derive(Debug)]
struct NoVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio::io::{duplex, AsyncReadExt};
    use tokio_rustls::TlsAcceptor;

    pub(crate) fn self_signed_acceptor() -> TlsAcceptor {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .unwrap();
        TlsAcceptor::from(Arc::new(config))
    }

    #[tokio::test]
    async fn round_trip_over_channel() {
        let acceptor = self_signed_acceptor();
        let (local, remote) = duplex(PIPE_CAPACITY);

        let backend = tokio::spawn(async move {
            let mut tls = acceptor.accept(remote).await.unwrap();
            let mut buf = [0u8; 5];
            tls.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            tls.write_all(b"world").await.unwrap();
            tls.flush().await.unwrap();
        });

        let mut bridge = TlsBridge::connect(Box::new(local), "localhost", client_config().unwrap())
            .await
            .unwrap();
        bridge.write_all(b"hello").await.unwrap();
        bridge.flush().await.unwrap();
        let mut buf = [0u8; 5];
        bridge.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        backend.await.unwrap();
        bridge.close().await;
    }

    #[tokio::test]
    async fn handshake_failure_is_tls_error() {
        let (local, remote) = duplex(PIPE_CAPACITY);
        drop(remote);
        let err = TlsBridge::connect(Box::new(local), "", client_config().unwrap())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::Tls(_)));
    }

    #[test]
    fn server_name_fallback() {
        assert!(matches!(server_name("backend.local"), ServerName::DnsName(_)));
        assert!(matches!(server_name(""), ServerName::IpAddress(_)));
        assert!(matches!(server_name("127.0.0.1"), ServerName::IpAddress(_)));
    }
}

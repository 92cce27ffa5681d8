//! Outbound transports: plain TCP and TLS.
//!
//! The connection manager is generic over [`Connector`] so the reconnect
//! state machine can be driven by any transport. [`TcpConnector`] is the
//! production implementation; in secure mode the peer certificate must
//! validate against the native root store, and a failed validation is
//! reported as [`ConnectionError::Unauthorized`].

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info};

use crate::config::Endpoint;

/// Errors from establishing a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Peer certificate failed validation
    #[error("secure connection to {endpoint} is not authorized: {reason}")]
    Unauthorized { endpoint: String, reason: String },

    /// Resolution, connect or handshake failed
    #[error("connection to {endpoint} failed: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// Host cannot be used as a TLS server name
    #[error("invalid server name '{0}'")]
    InvalidServerName(String),

    /// TLS client setup failed
    #[error("TLS setup failed: {0}")]
    Tls(String),
}

impl ConnectionError {
    /// Fatal errors stop the connection manager; the rest are retried.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ConnectionError::Io { .. })
    }
}

/// Opens connections to one endpoint.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn endpoint(&self) -> &Endpoint;

    /// Open a new connection.
    fn connect(&self) -> impl Future<Output = Result<Self::Stream, ConnectionError>> + Send;
}

/// A plain or TLS-wrapped TCP stream.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

struct TlsSettings {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// TCP connector with optional TLS.
pub struct TcpConnector {
    endpoint: Endpoint,
    tls: Option<TlsSettings>,
}

impl TcpConnector {
    /// Build a connector; secure endpoints trust the native root store.
    ///
    /// # Errors
    ///
    /// Fails if no native root certificate can be loaded or the host is not
    /// a valid TLS server name.
    pub fn new(endpoint: Endpoint) -> Result<Self, ConnectionError> {
        if !endpoint.secure {
            return Ok(Self {
                endpoint,
                tls: None,
            });
        }

        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectionError::Tls(e.to_string()))?
        .with_root_certificates(native_root_store()?)
        .with_no_client_auth();

        Self::with_tls_config(endpoint, Arc::new(config))
    }

    /// Build a secure connector with a caller-supplied TLS configuration.
    pub fn with_tls_config(
        endpoint: Endpoint,
        config: Arc<ClientConfig>,
    ) -> Result<Self, ConnectionError> {
        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|_| ConnectionError::InvalidServerName(endpoint.host.clone()))?;

        Ok(Self {
            endpoint,
            tls: Some(TlsSettings {
                connector: TlsConnector::from(config),
                server_name,
            }),
        })
    }

    fn io_error(&self, source: io::Error) -> ConnectionError {
        ConnectionError::Io {
            endpoint: self.endpoint.to_string(),
            source,
        }
    }

    async fn resolve(&self) -> Result<Vec<SocketAddr>, ConnectionError> {
        let host = (self.endpoint.host.as_str(), self.endpoint.port);
        match lookup_host(host).await {
            Ok(addrs) => {
                let addrs: Vec<SocketAddr> = addrs.collect();
                if let Some(addr) = addrs.first() {
                    debug!(
                        address = %addr.ip(),
                        family = if addr.is_ipv4() { 4 } else { 6 },
                        "successfully resolved DNS"
                    );
                }
                Ok(addrs)
            }
            Err(e) => {
                error!(host = %self.endpoint.host, error = %e, "failed to resolve DNS");
                Err(self.io_error(e))
            }
        }
    }
}

impl Connector for TcpConnector {
    type Stream = Transport;

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn connect(&self) -> Result<Transport, ConnectionError> {
        let addrs = self.resolve().await?;

        if self.tls.is_some() {
            info!(endpoint = %self.endpoint, "establishing secure connection");
        } else {
            info!(endpoint = %self.endpoint, "establishing plain-text connection");
        }

        let tcp = TcpStream::connect(&addrs[..])
            .await
            .map_err(|e| self.io_error(e))?;

        // Set TCP_NODELAY for lower latency (non-fatal if it fails)
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY, continuing with default buffering");
        }

        let Some(tls) = &self.tls else {
            return Ok(Transport::Plain(tcp));
        };

        let stream = tls
            .connector
            .connect(tls.server_name.clone(), tcp)
            .await
            .map_err(|e| classify_handshake_error(&self.endpoint, e))?;

        debug!(endpoint = %self.endpoint, "secure connection established");
        Ok(Transport::Tls(Box::new(stream)))
    }
}

/// Separate certificate failures (fatal) from transport failures.
pub fn classify_handshake_error(endpoint: &Endpoint, err: io::Error) -> ConnectionError {
    let tls_error = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());

    match tls_error {
        Some(
            reason @ (rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented),
        ) => ConnectionError::Unauthorized {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        },
        _ => ConnectionError::Io {
            endpoint: endpoint.to_string(),
            source: err,
        },
    }
}

fn native_root_store() -> Result<RootCertStore, ConnectionError> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();

    for err in &native.errors {
        debug!(error = %err, "failed to load a native certificate");
    }

    let mut valid_count = 0;
    for cert in native.certs {
        match roots.add(cert) {
            Ok(()) => valid_count += 1,
            Err(err) => debug!(error = %err, "failed to parse certificate"),
        }
    }

    if valid_count == 0 {
        return Err(ConnectionError::Tls(
            "no valid certificates found in native root store".to_string(),
        ));
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::{CertificateError, ServerConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    const CA_CERT: &[u8] = include_bytes!("../testdata/ca.der");
    const SERVER_CERT: &[u8] = include_bytes!("../testdata/localhost.der");
    const SERVER_KEY: &[u8] = include_bytes!("../testdata/localhost.key.der");

    fn client_config(roots: RootCertStore) -> Arc<ClientConfig> {
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
        Arc::new(config)
    }

    fn test_ca_roots() -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(CertificateDer::from(CA_CERT.to_vec())).unwrap();
        roots
    }

    /// Local TLS server presenting the `localhost` test certificate.
    ///
    /// Echoes the first five bytes back; handshake failures end the task.
    async fn tls_server() -> (Endpoint, tokio::task::JoinHandle<()>) {
        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from(SERVER_CERT.to_vec())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(SERVER_KEY.to_vec())),
        )
        .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint {
            host: "127.0.0.1".to_string(),
            port: listener.local_addr().unwrap().port(),
            secure: true,
        };

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let Ok(mut stream) = acceptor.accept(socket).await else {
                return;
            };
            let mut buf = [0u8; 5];
            if stream.read_exact(&mut buf).await.is_ok() {
                let _ = stream.write_all(&buf).await;
                let _ = stream.flush().await;
            }
        });
        (endpoint, server)
    }

    fn endpoint() -> Endpoint {
        Endpoint::resolve("eu", ".example.com", None, true).unwrap()
    }

    #[test]
    fn test_certificate_failure_is_unauthorized() {
        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer),
        );

        let classified = classify_handshake_error(&endpoint(), err);
        assert!(matches!(classified, ConnectionError::Unauthorized { .. }));
        assert!(classified.is_fatal());
        assert!(classified.to_string().contains("eu.example.com:443"));
    }

    #[test]
    fn test_missing_certificate_is_unauthorized() {
        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::NoCertificatesPresented,
        );
        assert!(matches!(
            classify_handshake_error(&endpoint(), err),
            ConnectionError::Unauthorized { .. }
        ));
    }

    #[test]
    fn test_transport_failure_is_retryable() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");

        let classified = classify_handshake_error(&endpoint(), err);
        assert!(matches!(classified, ConnectionError::Io { .. }));
        assert!(!classified.is_fatal());
    }

    #[test]
    fn test_invalid_server_name() {
        let endpoint = Endpoint {
            host: "not a host".to_string(),
            port: 443,
            secure: true,
        };
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();

        let result = TcpConnector::with_tls_config(endpoint, Arc::new(config));
        assert!(matches!(result, Err(ConnectionError::InvalidServerName(_))));
    }

    #[tokio::test]
    async fn test_tls_round_trip_with_trusted_ca() {
        let (endpoint, server) = tls_server().await;
        let connector = TcpConnector::with_tls_config(endpoint, client_config(test_ca_roots()))
            .unwrap();

        let mut stream = connector.connect().await.unwrap();
        assert!(matches!(stream, Transport::Tls(_)));

        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();
        let mut echoed = [0u8; 5];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_untrusted_server_certificate_is_unauthorized() {
        let (endpoint, server) = tls_server().await;
        let connector =
            TcpConnector::with_tls_config(endpoint, client_config(RootCertStore::empty()))
                .unwrap();

        let err = connector
            .connect()
            .await
            .err()
            .expect("handshake should fail");
        assert!(matches!(err, ConnectionError::Unauthorized { .. }), "{err}");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("127.0.0.1"));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_plain_connect_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let connector = TcpConnector::new(Endpoint::plain("127.0.0.1", port)).unwrap();
        let mut stream = connector.connect().await.unwrap();
        assert!(matches!(stream, Transport::Plain(_)));
        stream.write_all(b"hello").await.unwrap();

        assert_eq!(&server.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_connect_refused_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TcpConnector::new(Endpoint::plain("127.0.0.1", port)).unwrap();
        let err = connector.connect().await.err().expect("connect should fail");
        assert!(!err.is_fatal());
    }
}

//! Socket connections to a single server.
//!
//! A [`Connection`] owns one TCP, TLS-over-TCP, or Unix-domain stream and
//! moves whole wire-protocol messages across it. [`Connector`] is the seam the
//! pool uses to open new connections; [`TcpConnector`] is the production
//! implementation.
//!
//! ```text
//! Pool::acquire
//!   → Connector::connect(address)
//!     → DNS lookup (not charged to connectTimeoutMS)
//!     → TCP connect per resolved address   ┐ connectTimeoutMS
//!     → [TLS handshake (if enabled)]       ┘
//!     → nodelay, [keepalive]
//! ```

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::mem::MaybeUninit;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use socket2::SockRef;
use tidepool_core::{ClientOptions, DriverError, Result, ServerAddress, TlsOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::supervisor::{self, Phase};
use crate::wire::{HEADER_LEN, MessageHeader, Reply};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ── Stream ───────────────────────────────────────────────────────────

/// Underlying transport.
pub enum Stream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl Stream {
    fn socket(&self) -> SockRef<'_> {
        match self {
            Stream::Tcp(s) => SockRef::from(s),
            Stream::Tls(s) => SockRef::from(s.get_ref().0),
            #[cfg(unix)]
            Stream::Unix(s) => SockRef::from(s),
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

// ── Connection ───────────────────────────────────────────────────────

/// One socket to one server.
pub struct Connection {
    id: u64,
    address: ServerAddress,
    stream: Option<Stream>,
    tls: bool,
    keepalive: bool,
    created_at: Instant,
    last_used: Instant,
    /// Server cursor currently streaming exhaust batches over this socket.
    exhaust_cursor: Option<i64>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("tls", &self.tls)
            .field("keepalive", &self.keepalive)
            .field("closed", &self.is_closed())
            .field("exhaust_cursor", &self.exhaust_cursor)
            .finish()
    }
}

impl Connection {
    /// Wrap an established stream. Assigns a process-unique id.
    pub fn new(address: ServerAddress, stream: Stream, keepalive: bool) -> Self {
        let now = Instant::now();
        let tls = matches!(stream, Stream::Tls(_));
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            address,
            stream: Some(stream),
            tls,
            keepalive,
            created_at: now,
            last_used: now,
            exhaust_cursor: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn keepalive(&self) -> bool {
        self.keepalive
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// How long since the connection last carried a message or was returned.
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    pub fn exhaust_cursor(&self) -> Option<i64> {
        self.exhaust_cursor
    }

    pub fn set_exhaust_cursor(&mut self, cursor_id: Option<i64>) {
        self.exhaust_cursor = cursor_id;
    }

    /// Close the socket. Idempotent.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!(conn_id = self.id, address = %self.address, "closed connection");
        }
    }

    fn stream_mut(&mut self) -> Result<&mut Stream> {
        let address = &self.address;
        self.stream
            .as_mut()
            .ok_or_else(|| DriverError::AutoReconnect(format!("connection to {address} is closed")))
    }

    /// Write one complete message within `timeout`. Any failure closes the
    /// connection.
    pub async fn send(&mut self, message: &[u8], timeout: Option<Duration>) -> Result<()> {
        let address = self.address.clone();
        let stream = self.stream_mut()?;
        let result = supervisor::with_deadline(timeout, async {
            stream
                .write_all(message)
                .await
                .map_err(|e| supervisor::classify_io(&e, Phase::Send, &address))?;
            stream
                .flush()
                .await
                .map_err(|e| supervisor::classify_io(&e, Phase::Send, &address))
        })
        .await;
        self.finish(result)
    }

    /// Read one complete OP_REPLY within `timeout`. Any failure closes the
    /// connection.
    pub async fn receive(&mut self, timeout: Option<Duration>) -> Result<Reply> {
        let address = self.address.clone();
        let stream = self.stream_mut()?;
        let result = supervisor::with_deadline(timeout, async {
            let mut raw = [0u8; HEADER_LEN];
            stream
                .read_exact(&mut raw)
                .await
                .map_err(|e| supervisor::classify_io(&e, Phase::Receive, &address))?;
            let header = MessageHeader::parse(&raw)?;
            let mut body = vec![0u8; header.body_len()];
            stream
                .read_exact(&mut body)
                .await
                .map_err(|e| supervisor::classify_io(&e, Phase::Receive, &address))?;
            Reply::decode(&header, &body)
        })
        .await;
        self.finish(result)
    }

    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.touch(),
            Err(_) => self.close(),
        }
        result
    }

    /// Non-blocking liveness probe. A peer EOF, unsolicited bytes, or a
    /// socket error all mean the connection must not be reused.
    pub fn is_alive(&self) -> bool {
        let Some(stream) = &self.stream else {
            return false;
        };
        let mut buf = [MaybeUninit::<u8>::uninit(); 1];
        match stream.socket().peek(&mut buf) {
            Ok(_) => false,
            Err(e) => e.kind() == io::ErrorKind::WouldBlock,
        }
    }
}

// ── Connector ────────────────────────────────────────────────────────

/// Opens new connections for a pool.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, address: &'a ServerAddress) -> BoxFuture<'a, Result<Connection>>;
}

/// Production connector: TCP (optionally TLS) and Unix-domain sockets.
pub struct TcpConnector {
    connect_timeout: Option<Duration>,
    keepalive: bool,
    tls: Option<TlsConnector>,
}

impl fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnector")
            .field("connect_timeout", &self.connect_timeout)
            .field("keepalive", &self.keepalive)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl TcpConnector {
    /// Build a connector from client options. Loads TLS roots eagerly so a
    /// bad CA file is a configuration error, not a connect failure.
    pub fn new(options: &ClientOptions) -> Result<Self> {
        let tls = if options.tls.enabled {
            Some(TlsConnector::from(Arc::new(tls_client_config(&options.tls)?)))
        } else {
            None
        };
        Ok(Self {
            connect_timeout: options.connect_timeout,
            keepalive: options.socket_keepalive,
            tls,
        })
    }

    async fn connect_tcp(&self, address: &ServerAddress, host: &str, port: u16) -> Result<Connection> {
        let resolved: Vec<_> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| DriverError::ConnectionFailure(format!("{address}: dns resolution failed: {e}")))?
            .collect();
        if resolved.is_empty() {
            return Err(DriverError::ConnectionFailure(format!(
                "{address}: no addresses found"
            )));
        }

        let mut last_err = None;
        let mut connected = None;
        for addr in resolved {
            let attempt = supervisor::with_connect_deadline(self.connect_timeout, address, async {
                TcpStream::connect(addr)
                    .await
                    .map_err(|e| supervisor::classify_io(&e, Phase::Connect, address))
            })
            .await;
            match attempt {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(err) => {
                    tracing::debug!(address = %address, resolved = %addr, error = %err, "connect attempt failed");
                    last_err = Some(err);
                }
            }
        }
        let stream = match connected {
            Some(stream) => stream,
            None => {
                return Err(last_err.unwrap_or_else(|| {
                    DriverError::ConnectionFailure(format!("{address}: connect failed"))
                }));
            }
        };

        let _ = stream.set_nodelay(true);
        if self.keepalive {
            SockRef::from(&stream)
                .set_keepalive(true)
                .map_err(|e| DriverError::ConnectionFailure(format!("{address}: set keepalive: {e}")))?;
        }

        let stream = match &self.tls {
            Some(tls) => {
                let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                    .map_err(|e| DriverError::config(format!("invalid tls server name '{host}': {e}")))?;
                let tls_stream = supervisor::with_connect_deadline(self.connect_timeout, address, async {
                    tls.connect(server_name, stream)
                        .await
                        .map_err(|e| supervisor::classify_io(&e, Phase::Handshake, address))
                })
                .await?;
                Stream::Tls(Box::new(tls_stream))
            }
            None => Stream::Tcp(stream),
        };

        let conn = Connection::new(address.clone(), stream, self.keepalive);
        tracing::debug!(
            conn_id = conn.id(),
            address = %address,
            tls = conn.is_tls(),
            keepalive = self.keepalive,
            "established connection"
        );
        Ok(conn)
    }

    #[cfg(unix)]
    async fn connect_unix(&self, address: &ServerAddress, path: &std::path::Path) -> Result<Connection> {
        let stream = supervisor::with_connect_deadline(self.connect_timeout, address, async {
            tokio::net::UnixStream::connect(path)
                .await
                .map_err(|e| supervisor::classify_io(&e, Phase::Connect, address))
        })
        .await?;
        let conn = Connection::new(address.clone(), Stream::Unix(stream), false);
        tracing::debug!(conn_id = conn.id(), address = %address, "established unix connection");
        Ok(conn)
    }

    #[cfg(not(unix))]
    async fn connect_unix(&self, address: &ServerAddress, _path: &std::path::Path) -> Result<Connection> {
        Err(DriverError::ConnectionFailure(format!(
            "{address}: unix domain sockets are not supported on this platform"
        )))
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, address: &'a ServerAddress) -> BoxFuture<'a, Result<Connection>> {
        Box::pin(async move {
            match address {
                ServerAddress::Tcp { host, port } => self.connect_tcp(address, host, *port).await,
                ServerAddress::Unix { path } => self.connect_unix(address, path).await,
            }
        })
    }
}

// ── TLS configuration ────────────────────────────────────────────────

fn tls_client_config(options: &TlsOptions) -> Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()
    .map_err(|e| DriverError::config(format!("tls protocol version error: {e}")))?;

    if options.allow_invalid_certificates {
        tracing::warn!("tls certificate verification disabled");
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerifier))
            .with_no_client_auth());
    }

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = &options.ca_file {
        let file = File::open(path).map_err(|e| {
            DriverError::config(format!("failed to open tlsCAFile {}: {e}", path.display()))
        })?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| {
                DriverError::config(format!("failed to parse tlsCAFile {}: {e}", path.display()))
            })?;
        if certs.is_empty() {
            return Err(DriverError::config(format!(
                "no certificates found in tlsCAFile {}",
                path.display()
            )));
        }
        for cert in certs {
            root_store
                .add(cert)
                .map_err(|e| DriverError::config(format!("invalid CA certificate: {e}")))?;
        }
    }

    Ok(builder.with_root_certificates(root_store).with_no_client_auth())
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Accepts any server certificate (`tlsAllowInvalidCertificates=true`).
    #[derive(Debug)]
    pub struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

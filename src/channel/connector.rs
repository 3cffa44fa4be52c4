//! Transport establishment for the delivery channel.
//!
//! The channel only needs a byte stream; how that stream is produced is
//! decided by the injected [`Connector`]. [`TcpConnector`] opens plain TCP,
//! tunnelled through an HTTP proxy when one applies, and [`TlsConnector`]
//! encrypts whatever its inner connector returns. Tests substitute an
//! in-memory connector.

use std::io;
use std::sync::Arc;

use futures::future::BoxFuture;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::config::{PipelineConfig, ProxyCredentials, split_host_port};

/// A bidirectional byte stream to the backend.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed transport as stored by the channel.
pub type BoxedTransport = Box<dyn Transport>;

/// Opens transports to the intake endpoint.
pub trait Connector: Send + Sync {
    /// Connects according to `config`.
    fn connect<'a>(&'a self, config: &'a PipelineConfig) -> BoxFuture<'a, io::Result<BoxedTransport>>;
}

/// Connects over TCP, tunnelling through an HTTP proxy when one applies.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, config: &'a PipelineConfig) -> BoxFuture<'a, io::Result<BoxedTransport>> {
        Box::pin(async move {
            let stream = match &config.proxy {
                Some(proxy) if proxy.applies_to(&config.endpoint) => {
                    tracing::debug!(proxy = %proxy.address, endpoint = %config.endpoint, "connecting through proxy");
                    let stream = TcpStream::connect(&proxy.address).await?;
                    let authorization = proxy.credentials.as_ref().map(ProxyCredentials::authorization);
                    http_connect(stream, &config.endpoint, authorization.as_deref()).await?
                }
                _ => TcpStream::connect(&config.endpoint).await?,
            };
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedTransport)
        })
    }
}

/// Runs TLS over the transport of an inner connector.
///
/// The server certificate is verified against the configured roots and the
/// host part of the intake endpoint.
#[derive(Clone)]
pub struct TlsConnector<C> {
    inner: C,
    tls: tokio_rustls::TlsConnector,
}

impl<C> std::fmt::Debug for TlsConnector<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector").finish_non_exhaustive()
    }
}

impl<C> TlsConnector<C> {
    /// Trusts the Mozilla root certificates bundled by `webpki-roots`.
    ///
    /// # Errors
    ///
    /// Fails when the crypto provider supports no safe protocol version.
    pub fn with_webpki_roots(inner: C) -> Result<Self, rustls::Error> {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        Self::with_roots(inner, roots)
    }

    /// Trusts exactly `roots`.
    ///
    /// # Errors
    ///
    /// Fails when the crypto provider supports no safe protocol version.
    pub fn with_roots(inner: C, roots: RootCertStore) -> Result<Self, rustls::Error> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            inner,
            tls: tokio_rustls::TlsConnector::from(Arc::new(config)),
        })
    }
}

impl<C: Connector> Connector for TlsConnector<C> {
    fn connect<'a>(&'a self, config: &'a PipelineConfig) -> BoxFuture<'a, io::Result<BoxedTransport>> {
        Box::pin(async move {
            let server_name = server_name(&config.endpoint)?;
            let stream = self.inner.connect(config).await?;
            let stream = self.tls.connect(server_name, stream).await?;
            tracing::debug!(endpoint = %config.endpoint, "TLS session established");
            Ok(Box::new(stream) as BoxedTransport)
        })
    }
}

/// The name a certificate must be valid for: the host part of `endpoint`.
fn server_name(endpoint: &str) -> io::Result<ServerName<'static>> {
    let (host, _) = split_host_port(endpoint).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid intake endpoint {endpoint:?}"),
        )
    })?;
    ServerName::try_from(host.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Issues an HTTP `CONNECT` for `target` and returns the tunnelled stream.
async fn http_connect<S>(mut stream: S, target: &str, authorization: Option<&str>) -> io::Result<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(authorization) = authorization {
        request.push_str("Proxy-Authorization: ");
        request.push_str(authorization);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    // Read byte-wise so nothing past the header block is consumed.
    let mut reader = BufReader::with_capacity(1, &mut stream);
    let mut status = String::new();
    reader.read_line(&mut status).await?;

    let code = status.split_whitespace().nth(1).unwrap_or_default();
    if !status.starts_with("HTTP/1.") || code != "200" {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("proxy refused tunnel: {}", status.trim_end()),
        ));
    }

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed during CONNECT",
            ));
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    drop(reader);
    Ok(stream)
}

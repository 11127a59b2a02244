//! Outbound HTTP client used to reach the tunnel target.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::rt::{Read, Write};
use hyper::{header, Request, Response, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::translator::OutboundRequest;
use crate::error::{Error, Result};
use crate::relay::RelayBody;

/// Default bound on connecting to the target.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends outbound requests to the target. Immutable once built and shared
/// by every translation.
pub struct TargetClient {
    tls_config: Arc<ClientConfig>,
    connect_timeout: Option<Duration>,
}

impl Default for TargetClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetClient {
    /// Client trusting the bundled web PKI roots.
    pub fn new() -> Self {
        Self {
            tls_config: Arc::new(tls_config(web_pki_roots())),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
        }
    }

    /// Inject a custom TLS config (e.g. one trusting a test CA).
    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls_config = config;
        self
    }

    /// Trust the PEM certificates in `path` in addition to the web PKI roots.
    pub fn with_extra_roots(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read(path).map_err(|e| {
            Error::tls(format!("Failed to read CA file '{}': {}", path.display(), e))
        })?;
        let mut roots = web_pki_roots();
        let mut added = 0;
        for cert in rustls_pemfile::certs(&mut &pem[..]) {
            let cert = cert.map_err(|e| {
                Error::tls(format!("Invalid PEM in '{}': {}", path.display(), e))
            })?;
            roots
                .add(cert)
                .map_err(|e| Error::tls(format!("Rejected CA in '{}': {}", path.display(), e)))?;
            added += 1;
        }
        if added == 0 {
            return Err(Error::tls(format!(
                "No certificates found in '{}'",
                path.display()
            )));
        }
        self.tls_config = Arc::new(tls_config(roots));
        Ok(self)
    }

    /// `None` waits for the OS connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Send `request` and return as soon as the response head arrives. The
    /// response body is left streaming.
    pub async fn send(&self, request: OutboundRequest) -> Result<Response<Incoming>> {
        let url = request.url.clone();
        let host = url
            .host()
            .ok_or_else(|| Error::invalid_url(format!("{} has no host", url)))?;
        let scheme = url.scheme_str().unwrap_or_default();
        let port = url
            .port_u16()
            .or(match scheme {
                "http" => Some(80),
                "https" => Some(443),
                _ => None,
            })
            .ok_or_else(|| Error::invalid_url(format!("{} has no port", url)))?;
        let addr = format!("{}:{}", host, port);

        let tcp = self.connect(&addr).await?;

        match scheme {
            "http" => {
                let req = wire_request(request, false)?;
                send_http1(TokioIo::new(tcp), req).await
            }
            "https" => {
                let server_name = host.trim_start_matches('[').trim_end_matches(']');
                let server_name = rustls::pki_types::ServerName::try_from(server_name.to_string())
                    .map_err(|e| Error::tls(format!("Invalid server name '{}': {}", host, e)))?;
                let tls = TlsConnector::from(self.tls_config.clone())
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| Error::tls(format!("TLS connection to {} failed: {}", host, e)))?;

                let negotiated_h2 = tls.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
                tracing::debug!(host = %host, h2 = negotiated_h2, "Target TLS handshake complete");

                let req = wire_request(request, negotiated_h2)?;
                if negotiated_h2 {
                    send_http2(TokioIo::new(tls), req).await
                } else {
                    send_http1(TokioIo::new(tls), req).await
                }
            }
            other => Err(Error::invalid_url(format!(
                "unsupported target scheme {:?}",
                other
            ))),
        }
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let connect = TcpStream::connect(addr);
        let result = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| Error::timeout(format!("connecting to {} after {:?}", addr, limit)))?,
            None => connect.await,
        };
        result.map_err(|e| Error::upstream(format!("Failed to connect to {}: {}", addr, e)))
    }
}

fn web_pki_roots() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

fn tls_config(roots: rustls::RootCertStore) -> ClientConfig {
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    config
}

/// Build the request as it goes on the wire: general headers, then content
/// headers, then the target's own `Host` for HTTP/1.1. HTTP/2 carries the
/// authority in the absolute URI instead.
fn wire_request(request: OutboundRequest, h2: bool) -> Result<Request<RelayBody>> {
    let OutboundRequest {
        method,
        url,
        headers,
        body,
    } = request;

    let uri = if h2 {
        url.clone()
    } else {
        url.path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse::<Uri>()
            .map_err(|e| Error::invalid_url(format!("{}: {}", url, e)))?
    };

    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    if !h2 {
        let authority = url
            .authority()
            .ok_or_else(|| Error::invalid_url(format!("{} has no host", url)))?;
        builder = builder.header(header::HOST, authority.as_str());
    }

    builder
        .body(body)
        .map_err(|e| Error::upstream(format!("Failed to build request: {}", e)))
}

async fn send_http1<IO>(io: IO, req: Request<RelayBody>) -> Result<Response<Incoming>>
where
    IO: Read + Write + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| Error::upstream(format!("HTTP handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "Target connection error");
        }
    });

    sender
        .send_request(req)
        .await
        .map_err(|e| Error::upstream(format!("Request failed: {}", e)))
}

async fn send_http2<IO>(io: IO, req: Request<RelayBody>) -> Result<Response<Incoming>>
where
    IO: Read + Write + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http2::handshake(TokioExecutor::new(), io)
        .await
        .map_err(|e| Error::upstream(format!("HTTP/2 handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "Target HTTP/2 connection error");
        }
    });

    sender
        .send_request(req)
        .await
        .map_err(|e| Error::upstream(format!("HTTP/2 request failed: {}", e)))
}

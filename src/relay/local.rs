//! Loopback relay channel.
//!
//! Serves `Endpoint=http://host:port/` connection strings by listening on
//! that address directly. Each HTTP/1.1 request under `/<entity>/` becomes a
//! [`RelayedRequest`]; the response is whatever the handler writes to the
//! [`ResponseSink`]. Useful for development and for exercising the tunnel
//! without a hosted relay.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::{Position, Url};

use super::{
    BoxError, ChannelError, ConnectionString, RelayChannel, RelayConnector, RelayedRequest,
    RequestHandler, ResponseSink,
};

type LocalBody = BoxBody<Bytes, Infallible>;

/// Opens [`LocalRelayChannel`]s for `http://` endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalRelayConnector;

#[async_trait]
impl RelayConnector for LocalRelayConnector {
    async fn open(
        &self,
        connection: &ConnectionString,
    ) -> Result<Box<dyn RelayChannel>, ChannelError> {
        let endpoint = connection.endpoint();
        if endpoint.scheme() != "http" {
            return Err(ChannelError::other(format!(
                "unsupported relay endpoint scheme {:?}: only http:// endpoints can be served locally",
                endpoint.scheme()
            )));
        }
        let host = endpoint.host_str().unwrap_or("127.0.0.1").to_string();
        let port = endpoint.port_or_known_default().unwrap_or(80);

        let listener = TcpListener::bind((host.as_str(), port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrNotAvailable => {
                    ChannelError::NotFound(format!("{}:{}: {}", host, port, e))
                }
                _ => ChannelError::other(format!("Failed to bind to {}:{}: {}", host, port, e)),
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ChannelError::other(format!("Failed to get local address: {}", e)))?;

        // Port 0 binds an ephemeral port; publish the one we actually got.
        let address = with_port(connection.address(), local_addr.port());

        tracing::info!(address = %address, "Local relay channel listening");

        let shared = Arc::new(Shared {
            address,
            handler: RwLock::new(None),
        });
        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(listener, shared.clone(), shutdown.clone()));

        Ok(Box::new(LocalRelayChannel {
            shared,
            shutdown,
            accept_task: Some(accept_task),
            local_addr,
        }))
    }
}

struct Shared {
    address: Url,
    handler: RwLock<Option<RequestHandler>>,
}

impl Shared {
    fn handler(&self) -> Option<RequestHandler> {
        self.handler.read().ok().and_then(|h| h.clone())
    }

    /// Whether `path` addresses this channel's entity.
    fn owns_path(&self, path: &str) -> bool {
        let prefix = self.address.path();
        path.starts_with(prefix) || path == prefix.trim_end_matches('/')
    }
}

/// A relay channel served straight from a local TCP listener.
pub struct LocalRelayChannel {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl LocalRelayChannel {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl RelayChannel for LocalRelayChannel {
    fn address(&self) -> &Url {
        &self.shared.address
    }

    fn public_url(&self) -> Url {
        self.shared.address.clone()
    }

    fn register_handler(&self, handler: RequestHandler) {
        if let Ok(mut slot) = self.shared.handler.write() {
            *slot = Some(handler);
        }
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.shutdown.cancel();
        if let Some(task) = self.accept_task.take() {
            task.await
                .map_err(|e| ChannelError::other(format!("accept loop failed: {}", e)))?;
        }
        if let Ok(mut slot) = self.shared.handler.write() {
            *slot = None;
        }
        tracing::info!(address = %self.shared.address, "Local relay channel closed");
        Ok(())
    }
}

impl Drop for LocalRelayChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("Relay listener stopped");
                return;
            }
            result = listener.accept() => {
                let (stream, client_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                tracing::debug!(client = %client_addr, "New relay connection");
                spawn_connection(stream, client_addr, shared.clone(), shutdown.clone());
            }
        }
    }
}

fn spawn_connection(
    stream: TcpStream,
    client_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let io = TokioIo::new(stream);
        let service_shared = shared.clone();
        let service_shutdown = shutdown.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let shared = service_shared.clone();
            let shutdown = service_shutdown.clone();
            async move { Ok::<_, Infallible>(relay_request(req, &shared, &shutdown).await) }
        });

        let conn = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service);
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = shutdown.cancelled() => {
                // Let in-flight responses finish, refuse further keep-alive requests.
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };
        if let Err(e) = result {
            if !e.to_string().contains("connection closed") {
                tracing::debug!(client = %client_addr, error = %e, "Relay connection error");
            }
        }
    });
}

async fn relay_request(
    req: Request<Incoming>,
    shared: &Shared,
    shutdown: &CancellationToken,
) -> Response<LocalBody> {
    if shutdown.is_cancelled() {
        return status_response(StatusCode::SERVICE_UNAVAILABLE);
    }
    if !shared.owns_path(req.uri().path()) {
        return status_response(StatusCode::NOT_FOUND);
    }
    let Some(handler) = shared.handler() else {
        tracing::debug!(path = %req.uri().path(), "No handler registered, rejecting request");
        return status_response(StatusCode::SERVICE_UNAVAILABLE);
    };

    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let origin = &shared.address[..Position::BeforePath];
    let url: Uri = match format!("{}{}", origin, path_and_query).parse() {
        Ok(url) => url,
        Err(e) => {
            tracing::debug!(error = %e, "Unparseable relayed URL");
            return status_response(StatusCode::BAD_REQUEST);
        }
    };

    let body = body.map_err(|e| -> BoxError { Box::new(e) }).boxed();
    let request = RelayedRequest::new(parts.method, url, parts.headers, body);
    let (sink, pending) = ResponseSink::channel();
    handler(request, sink);

    match pending.head().await {
        Ok((head, body)) => {
            let mut response = Response::new(body.boxed());
            *response.status_mut() = head.status;
            *response.headers_mut() = head.headers;
            if let Some(reason) = head.reason {
                match ReasonPhrase::try_from(reason.as_bytes()) {
                    Ok(phrase) => {
                        response.extensions_mut().insert(phrase);
                    }
                    Err(_) => tracing::debug!(reason = %reason, "Dropping invalid reason phrase"),
                }
            }
            response
        }
        Err(_) => status_response(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// `address` with its port replaced. URLs that can't carry a port are
/// returned unchanged.
fn with_port(mut address: Url, port: u16) -> Url {
    if let Err(()) = address.set_port(Some(port)) {
        tracing::debug!(address = %address, port, "Channel address cannot carry a port");
    }
    address
}

fn status_response(status: StatusCode) -> Response<LocalBody> {
    let mut response = Response::new(Empty::<Bytes>::new().boxed());
    *response.status_mut() = status;
    response
}

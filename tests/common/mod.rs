//! Test infrastructure for tunnel integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::ext::ReasonPhrase;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use ikspoz::events::{self, EventStream, TunnelEvent};
use ikspoz::{ConnectionString, LocalRelayConnector, TargetClient, TunnelEngine};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

/// Entity every test tunnel is served under.
pub const ENTITY: &str = "ikspoz";

// ---------------------------------------------------------------------------
// TestTarget — a tiny HTTP/1.1 server standing in for the tunnel target
// ---------------------------------------------------------------------------

pub type TargetBody = BoxBody<Bytes, hyper::Error>;

/// A handler function for the test target.
pub type TargetHandler = Arc<dyn Fn(Request<Incoming>) -> TargetResponse + Send + Sync + 'static>;

pub type TargetResponse = std::pin::Pin<
    Box<
        dyn std::future::Future<Output = std::result::Result<Response<TargetBody>, hyper::Error>>
            + Send,
    >,
>;

pub struct TestTarget {
    pub addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestTarget {
    /// Start a test target server that responds with the given handler.
    pub async fn start(handler: TargetHandler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    result = listener.accept() => {
                        let (stream, _) = match result {
                            Ok(conn) => conn,
                            Err(_) => continue,
                        };
                        let handler = handler.clone();

                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req: Request<Incoming>| {
                                let handler = handler.clone();
                                handler(req)
                            });
                            let _ = http1::Builder::new().serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self { addr, shutdown_tx }
    }

    /// Base URL of the target.
    pub fn url(&self) -> Url {
        Url::parse(&format!("http://{}/", self.addr)).unwrap()
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn full(body: impl Into<Bytes>) -> TargetBody {
    Full::new(body.into()).map_err(|e| match e {}).boxed()
}

/// A target handler that returns 200 with a fixed body and content type.
pub fn ok_handler(content_type: &'static str, body: &'static str) -> TargetHandler {
    Arc::new(move |_req| {
        Box::pin(async move {
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", content_type)
                .body(full(body))
                .unwrap())
        })
    })
}

/// A target handler that echoes the request line, headers and body back.
pub fn echo_handler() -> TargetHandler {
    Arc::new(|req: Request<Incoming>| {
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = body.collect().await?.to_bytes();

            let mut header_lines = Vec::new();
            for (name, value) in parts.headers.iter() {
                header_lines.push(format!("{}: {}", name, value.to_str().unwrap_or("?")));
            }

            let text = format!(
                "method={}\npath={}\nquery={}\n{}\n\n{}",
                parts.method,
                parts.uri.path(),
                parts.uri.query().unwrap_or(""),
                header_lines.join("\n"),
                String::from_utf8_lossy(&body)
            );

            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain")
                .header("X-Echo", "true")
                .body(full(text))
                .unwrap())
        })
    })
}

/// A target handler that answers with a custom status and reason phrase.
pub fn reason_handler(status: u16, reason: &'static str) -> TargetHandler {
    Arc::new(move |_req| {
        Box::pin(async move {
            let mut response = Response::builder()
                .status(status)
                .header("Content-Length", "0")
                .body(full(Bytes::new()))
                .unwrap();
            response
                .extensions_mut()
                .insert(ReasonPhrase::from_static(reason.as_bytes()));
            Ok(response)
        })
    })
}

/// A target handler that sends its headers and then never sends a body.
pub fn stalled_body_handler() -> TargetHandler {
    Arc::new(|_req| {
        Box::pin(async move {
            let stream = futures_util::stream::pending::<Result<Frame<Bytes>, hyper::Error>>();
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/octet-stream")
                .header("Content-Length", "1024")
                .body(StreamBody::new(stream).boxed())
                .unwrap())
        })
    })
}

/// A target handler that repeats a header with several values.
pub fn multi_header_handler() -> TargetHandler {
    Arc::new(|_req| {
        Box::pin(async move {
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Set-Cookie", "a=1")
                .header("Content-Language", "en")
                .header("Set-Cookie", "b=2")
                .header("Content-Language", "fr")
                .body(full("cookies"))
                .unwrap())
        })
    })
}

/// An address nothing is listening on.
pub async fn dead_target() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Url::parse(&format!("http://{}/", addr)).unwrap()
}

// ---------------------------------------------------------------------------
// TestTunnel — an engine on the loopback relay channel
// ---------------------------------------------------------------------------

pub struct TestTunnel {
    pub engine: TunnelEngine,
    pub public_url: Url,
    pub events: EventStream,
}

impl TestTunnel {
    /// Open a tunnel to `target` on an ephemeral local port.
    pub async fn start(target: &Url) -> Self {
        Self::start_with_client(target, TargetClient::new()).await
    }

    pub async fn start_with_client(target: &Url, client: TargetClient) -> Self {
        let (emitter, events) = events::channel(256);
        let mut engine = TunnelEngine::new(Arc::new(LocalRelayConnector), target)
            .unwrap()
            .with_client(client)
            .with_events(emitter);
        let public_url = engine.open(&local_connection()).await.unwrap();
        Self {
            engine,
            public_url,
            events,
        }
    }

    /// Public URL for a path relative to the tunnel.
    pub fn url(&self, relative: &str) -> String {
        self.public_url.join(relative).unwrap().to_string()
    }

    /// `host:port` of the relay listener.
    pub fn relay_authority(&self) -> String {
        format!(
            "{}:{}",
            self.public_url.host_str().unwrap(),
            self.public_url.port().unwrap()
        )
    }

    /// Wait for the next event satisfying `pred`, skipping others.
    pub async fn wait_for(&mut self, pred: impl Fn(&TunnelEvent) -> bool) -> TunnelEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = self.events.recv().await.expect("event stream ended");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    pub async fn close(mut self) {
        self.engine.close().await.unwrap();
    }
}

/// Connection string for a loopback channel on an ephemeral port.
pub fn local_connection() -> ConnectionString {
    ConnectionString::parse(&format!("Endpoint=http://127.0.0.1:0/;EntityPath={}", ENTITY))
        .unwrap()
}

/// Send a raw HTTP/1.1 GET and return the whole response as text. Used where
/// the exact status line matters.
pub async fn raw_get(authority: &str, path: &str) -> String {
    let mut stream = TcpStream::connect(authority).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, authority
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .expect("timed out reading response")
        .unwrap();
    String::from_utf8_lossy(&response).to_string()
}

/// First line of a raw HTTP response.
pub fn status_line(response: &str) -> &str {
    response.lines().next().unwrap_or("")
}

/// Plain reqwest client for calling the tunnel.
pub fn test_client() -> reqwest::Client {
    reqwest::Client::builder().build().unwrap()
}

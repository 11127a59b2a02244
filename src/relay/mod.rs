//! The relay channel boundary.
//!
//! A relay channel exposes a public URL and hands every inbound request to a
//! single registered [`RequestHandler`] together with a [`ResponseSink`].
//! The tunnel core only sees the types in this module; how a channel talks to
//! its relay service is up to the [`RelayConnector`] implementation.

mod connection_string;
mod local;
mod sink;

pub use connection_string::ConnectionString;
pub use local::LocalRelayConnector;
pub use sink::{PendingResponse, ResponseHead, ResponseSink, SinkBody, SinkError};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::{HeaderMap, Method, Uri};
use url::Url;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Streamed body of a relayed request.
pub type RelayBody = BoxBody<Bytes, BoxError>;

/// An empty relayed body.
pub fn empty_body() -> RelayBody {
    Empty::<Bytes>::new().map_err(|e| match e {}).boxed()
}

/// A relayed body holding a single in-memory chunk.
pub fn full_body(data: impl Into<Bytes>) -> RelayBody {
    Full::new(data.into()).map_err(|e| match e {}).boxed()
}

/// One inbound request delivered by a relay channel.
pub struct RelayedRequest {
    pub method: Method,
    /// Absolute URL under the channel's own address.
    pub url: Uri,
    pub headers: HeaderMap,
    pub body: RelayBody,
}

impl RelayedRequest {
    pub fn new(method: Method, url: Uri, headers: HeaderMap, body: RelayBody) -> Self {
        Self {
            method,
            url,
            headers,
            body,
        }
    }
}

impl std::fmt::Debug for RelayedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayedRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Callback invoked once per inbound request. Fire-and-forget from the
/// channel's point of view: the handler owns the sink from here on.
pub type RequestHandler = Arc<dyn Fn(RelayedRequest, ResponseSink) + Send + Sync>;

/// Failures reported by a relay channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("relay endpoint not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl ChannelError {
    pub fn other(msg: impl Into<String>) -> Self {
        ChannelError::Other(msg.into())
    }
}

/// Opens relay channels from a connection string.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn open(
        &self,
        connection: &ConnectionString,
    ) -> std::result::Result<Box<dyn RelayChannel>, ChannelError>;
}

/// An open relay channel.
#[async_trait]
pub trait RelayChannel: Send + Sync {
    /// Base address inbound request URLs are relative to.
    fn address(&self) -> &Url;

    /// Address callers use to reach the tunnel.
    fn public_url(&self) -> Url;

    /// Install the handler for inbound requests. Requests that arrive before
    /// a handler is registered are rejected by the channel.
    fn register_handler(&self, handler: RequestHandler);

    /// Stop accepting requests and wait until the channel has shut down.
    async fn close(&mut self) -> std::result::Result<(), ChannelError>;
}

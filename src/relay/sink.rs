//! Response sink handed to the request handler alongside each relayed request.
//!
//! The sink buffers the response head (status, description, headers) until
//! the first body chunk is written or the sink is closed. Until then the head
//! can still be replaced, which is how a translation that is cut short turns
//! into a synthetic failure status. The channel side holds the matching
//! [`PendingResponse`] and turns it into whatever its wire format needs.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, StatusCode};
use tokio::sync::{mpsc, oneshot};

/// Body chunks buffered between the sink and the channel.
const BODY_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("response head already sent")]
    HeadersFlushed,

    #[error("response sink is closed")]
    Closed,

    #[error("caller disconnected")]
    Disconnected,
}

/// Status line and headers of a relayed response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: HeaderMap,
}

impl Default for ResponseHead {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            reason: None,
            headers: HeaderMap::new(),
        }
    }
}

pub struct ResponseSink {
    head: ResponseHead,
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    body_tx: Option<mpsc::Sender<Bytes>>,
    closed: bool,
}

impl ResponseSink {
    /// Create a connected sink and the channel-side receiver for it.
    pub fn channel() -> (ResponseSink, PendingResponse) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let sink = ResponseSink {
            head: ResponseHead::default(),
            head_tx: Some(head_tx),
            body_tx: Some(body_tx),
            closed: false,
        };
        (sink, PendingResponse { head_rx, body_rx })
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn status_description(&self) -> Option<&str> {
        self.head.reason.as_deref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// Whether the head has been handed to the channel.
    pub fn is_flushed(&self) -> bool {
        self.head_tx.is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn check_head_writable(&self) -> Result<(), SinkError> {
        if self.closed {
            Err(SinkError::Closed)
        } else if self.is_flushed() {
            Err(SinkError::HeadersFlushed)
        } else {
            Ok(())
        }
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<(), SinkError> {
        self.check_head_writable()?;
        self.head.status = status;
        Ok(())
    }

    pub fn set_status_description(&mut self, reason: impl Into<String>) -> Result<(), SinkError> {
        self.check_head_writable()?;
        self.head.reason = Some(reason.into());
        Ok(())
    }

    /// Append one header value, keeping any values already present.
    pub fn append_header(&mut self, name: HeaderName, value: HeaderValue) -> Result<(), SinkError> {
        self.check_head_writable()?;
        self.head.headers.append(name, value);
        Ok(())
    }

    /// Replace the head with a bodiless 500 carrying `reason`.
    pub fn fail(&mut self, reason: &str) -> Result<(), SinkError> {
        self.check_head_writable()?;
        self.head = ResponseHead {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            reason: Some(reason.to_string()),
            headers: HeaderMap::new(),
        };
        Ok(())
    }

    fn flush_head(&mut self) {
        if let Some(tx) = self.head_tx.take() {
            // A dropped receiver means the caller went away; writes will report it.
            let _ = tx.send(self.head.clone());
        }
    }

    /// Write one body chunk, sending the head first if it has not gone out yet.
    pub async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        self.flush_head();
        let tx = self.body_tx.as_ref().ok_or(SinkError::Closed)?;
        tx.send(chunk).await.map_err(|_| SinkError::Disconnected)
    }

    /// Finish the response. Returns `false` if the sink was already closed.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.flush_head();
        self.body_tx = None;
        self.closed = true;
        true
    }
}

impl Drop for ResponseSink {
    fn drop(&mut self) {
        if self.close() {
            tracing::trace!("response sink closed on drop");
        }
    }
}

/// Channel-side half of a [`ResponseSink`].
pub struct PendingResponse {
    head_rx: oneshot::Receiver<ResponseHead>,
    body_rx: mpsc::Receiver<Bytes>,
}

impl PendingResponse {
    /// Wait for the head; the body keeps streaming through the returned [`SinkBody`].
    pub async fn head(self) -> Result<(ResponseHead, SinkBody), SinkError> {
        let head = self.head_rx.await.map_err(|_| SinkError::Disconnected)?;
        Ok((head, SinkBody { rx: self.body_rx }))
    }

    /// Wait for the whole response and buffer its body.
    pub async fn collect(self) -> Result<(ResponseHead, Bytes), SinkError> {
        let (head, body) = self.head().await?;
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(never) => match never {},
        };
        Ok((head, body))
    }
}

/// Response body fed by [`ResponseSink::write`]; ends when the sink closes.
pub struct SinkBody {
    rx: mpsc::Receiver<Bytes>,
}

impl Body for SinkBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        self.get_mut()
            .rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|data| Ok(Frame::data(data))))
    }
}

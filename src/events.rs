//! Tunnel lifecycle and per-request notifications.
//!
//! The engine and translator publish [`TunnelEvent`]s through an
//! [`EventEmitter`]; the presentation layer drains them from the matching
//! [`EventStream`]. Emitting never blocks and never fails: when the queue is
//! full the event is dropped and a warning is logged.

use std::fmt;
use std::sync::Arc;

use hyper::{Method, StatusCode};
use tokio::sync::mpsc;
use url::Url;

use crate::error::Error;

/// Default capacity of the event queue.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// What the presentation layer needs to show for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: String,
}

impl fmt::Display for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.method, self.url)
    }
}

/// What the presentation layer needs to show for a target response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseDescriptor {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub content_length: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum TunnelEvent {
    Connecting,
    Connected {
        public_url: Url,
    },
    RequestReceived {
        request: RequestDescriptor,
    },
    RequestForwarded {
        request: RequestDescriptor,
    },
    ResponseReceived {
        request: RequestDescriptor,
        response: ResponseDescriptor,
    },
    RequestError {
        request: RequestDescriptor,
        error: Arc<Error>,
    },
    ResponseError {
        request: RequestDescriptor,
        error: Arc<Error>,
    },
    Closing,
    Closed,
}

impl TunnelEvent {
    /// Stable snake_case name, used in logs and tests.
    pub fn name(&self) -> &'static str {
        match self {
            TunnelEvent::Connecting => "connecting",
            TunnelEvent::Connected { .. } => "connected",
            TunnelEvent::RequestReceived { .. } => "request_received",
            TunnelEvent::RequestForwarded { .. } => "request_forwarded",
            TunnelEvent::ResponseReceived { .. } => "response_received",
            TunnelEvent::RequestError { .. } => "request_error",
            TunnelEvent::ResponseError { .. } => "response_error",
            TunnelEvent::Closing => "closing",
            TunnelEvent::Closed => "closed",
        }
    }
}

/// Sending half of the event queue. Cheap to clone.
#[derive(Clone, Default)]
pub struct EventEmitter {
    tx: Option<mpsc::Sender<TunnelEvent>>,
}

impl EventEmitter {
    /// An emitter with no listener; every event is discarded.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: TunnelEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(event = event.name(), "Event queue full, dropping event");
            }
            // Listener is gone; nobody to tell.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Receiving half of the event queue.
pub struct EventStream {
    rx: mpsc::Receiver<TunnelEvent>,
}

impl EventStream {
    /// Next event, or `None` once every emitter is gone.
    pub async fn recv(&mut self) -> Option<TunnelEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<TunnelEvent> {
        self.rx.try_recv().ok()
    }
}

/// Create a bounded event queue. `capacity` is clamped to at least 1.
pub fn channel(capacity: usize) -> (EventEmitter, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventEmitter { tx: Some(tx) }, EventStream { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ikspoz_test_support::test_report;

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let t = test_report!("Events from one emitter arrive in emission order");
        let (emitter, mut stream) = channel(8);
        emitter.emit(TunnelEvent::Connecting);
        emitter.emit(TunnelEvent::Closing);
        emitter.emit(TunnelEvent::Closed);
        drop(emitter);

        let mut names = Vec::new();
        while let Some(event) = stream.recv().await {
            names.push(event.name());
        }
        t.assert_eq("order", &names, &vec!["connecting", "closing", "closed"]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let t = test_report!("A full queue drops events without blocking the emitter");
        let (emitter, mut stream) = channel(1);
        emitter.emit(TunnelEvent::Connecting);
        emitter.emit(TunnelEvent::Closing);
        emitter.emit(TunnelEvent::Closed);

        t.assert_eq(
            "first kept",
            &stream.try_recv().map(|e| e.name()),
            &Some("connecting"),
        );
        t.assert_true("rest dropped", stream.try_recv().is_none());
    }

    #[test]
    fn test_emit_without_listener_is_harmless() {
        let t = test_report!("Emitting after the stream is dropped is a no-op");
        let (emitter, stream) = channel(4);
        drop(stream);
        emitter.emit(TunnelEvent::Connecting);
        EventEmitter::disabled().emit(TunnelEvent::Closed);
        t.assert_true("survived", true);
    }

    #[test]
    fn test_request_descriptor_display() {
        let t = test_report!("Request descriptors render as METHOD - URL");
        let descriptor = RequestDescriptor {
            method: Method::POST,
            url: "http://localhost:3000/items".to_string(),
        };
        t.assert_eq(
            "display",
            &descriptor.to_string().as_str(),
            &"POST - http://localhost:3000/items",
        );
    }
}

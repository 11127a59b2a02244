//! Per-request translation between the relay channel and the target.
//!
//! A translation runs as one task per relayed request:
//!
//! 1. bail out with "Tunnel closing" if shutdown has already begun,
//! 2. map the request onto the target base URL and split its headers,
//! 3. send it, waiting only for the response head,
//! 4. copy status, reason and headers onto the sink,
//! 5. stream the body across until it ends, fails, or shutdown interrupts it.
//!
//! The sink is closed exactly once whichever way the translation ends.

use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::http::response::Parts;
use hyper::{header, Method, Uri};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::client::TargetClient;
use super::headers::{classify, HeaderTreatment, PartitionedHeaders};
use super::response;
use crate::error::{Error, Result};
use crate::events::{EventEmitter, RequestDescriptor, ResponseDescriptor, TunnelEvent};
use crate::relay::{RelayBody, RelayedRequest, ResponseSink, SinkError};

/// A relayed request rewritten for the target.
pub struct OutboundRequest {
    pub method: Method,
    /// Absolute target URI. Path and query are the relayed bytes, untouched.
    pub url: Uri,
    /// `general` headers go on the request itself, `content` headers
    /// describe the body.
    pub headers: PartitionedHeaders,
    pub body: RelayBody,
}

impl OutboundRequest {
    pub fn describe(&self) -> RequestDescriptor {
        RequestDescriptor {
            method: self.method.clone(),
            url: self.url.to_string(),
        }
    }
}

/// How a translation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationOutcome {
    /// The target's response was relayed in full.
    Completed,
    /// The target could not be reached; a synthetic 500 was sent.
    RequestFailed,
    /// Relaying the response body broke off part way.
    ResponseFailed,
    /// Shutdown interrupted the translation.
    Closing,
}

enum CopyOutcome {
    Completed,
    Failed(Error),
    Canceled,
}

/// Validate a target base URL and make sure it ends in `/`, so relative
/// paths are appended to it rather than replacing its last segment.
/// Credentials, query and fragment are dropped.
pub fn target_base(url: &Url) -> Result<Url> {
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::invalid_url(format!(
                "target must be http or https, got {:?}",
                other
            )))
        }
    }
    if url.host_str().is_none() {
        return Err(Error::invalid_url(format!("target {} has no host", url)));
    }
    let mut base = url.clone();
    base.set_username("")
        .and_then(|()| base.set_password(None))
        .map_err(|()| Error::invalid_url(format!("cannot strip credentials from {}", url)))?;
    base.set_fragment(None);
    base.set_query(None);
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

pub struct RequestTranslator {
    target: Url,
    channel_base: Url,
    client: Arc<TargetClient>,
    events: EventEmitter,
    shutdown: CancellationToken,
}

impl RequestTranslator {
    pub fn new(
        target: &Url,
        channel_base: Url,
        client: Arc<TargetClient>,
        events: EventEmitter,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        Ok(Self {
            target: target_base(target)?,
            channel_base,
            client,
            events,
            shutdown,
        })
    }

    /// Target URI for a relayed request: the request's path and query made
    /// relative to the channel address and appended to the target base.
    ///
    /// The remainder is appended as raw bytes, never resolved, so percent
    /// escapes, dot segments and characters such as `'` or `{}` reach the
    /// target exactly as the caller sent them.
    pub fn target_url(&self, relayed: &Uri) -> Result<Uri> {
        let path = relayed.path();
        let base_path = self.channel_base.path();
        let relative = path
            .strip_prefix(base_path)
            .or_else(|| (path == base_path.trim_end_matches('/')).then_some(""))
            .unwrap_or(path);
        // The base ends in '/', so the remainder can't reach the authority.
        let relative = relative.trim_start_matches('/');

        let mut target = String::with_capacity(self.target.as_str().len() + relative.len());
        target.push_str(self.target.as_str());
        target.push_str(relative);
        if let Some(query) = relayed.query() {
            target.push('?');
            target.push_str(query);
        }

        target
            .parse::<Uri>()
            .map_err(|e| Error::invalid_url(format!("cannot map {} onto {}: {}", relayed, self.target, e)))
    }

    /// Rewrite a relayed request for the target. The body is attached unread.
    pub fn build_outbound(&self, request: RelayedRequest) -> Result<OutboundRequest> {
        let url = self.target_url(&request.url)?;
        Ok(OutboundRequest {
            method: request.method,
            url,
            headers: PartitionedHeaders::split(&request.headers),
            body: request.body,
        })
    }

    /// Tunnel one request and close its sink.
    pub async fn translate(&self, request: RelayedRequest, mut sink: ResponseSink) -> TranslationOutcome {
        let received = RequestDescriptor {
            method: request.method.clone(),
            url: request.url.to_string(),
        };
        self.events.emit(TunnelEvent::RequestReceived {
            request: received.clone(),
        });

        let outcome = self.run(request, &received, &mut sink).await;
        sink.close();

        tracing::debug!(
            method = %received.method,
            url = %received.url,
            outcome = ?outcome,
            "Request tunneled"
        );
        outcome
    }

    async fn run(
        &self,
        request: RelayedRequest,
        received: &RequestDescriptor,
        sink: &mut ResponseSink,
    ) -> TranslationOutcome {
        if self.shutdown.is_cancelled() {
            response::tunnel_closing(sink);
            return TranslationOutcome::Closing;
        }

        let outbound = match self.build_outbound(request) {
            Ok(outbound) => outbound,
            Err(e) => return self.request_failed(received, e, sink),
        };
        let forwarded = outbound.describe();
        self.events.emit(TunnelEvent::RequestForwarded {
            request: forwarded.clone(),
        });

        let sent = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                Err(Error::upstream("tunnel closed before the target responded"))
            }
            result = self.client.send(outbound) => result,
        };
        let target_response = match sent {
            Ok(target_response) => target_response,
            Err(e) => return self.request_failed(&forwarded, e, sink),
        };

        let (parts, body) = target_response.into_parts();
        self.events.emit(TunnelEvent::ResponseReceived {
            request: forwarded.clone(),
            response: describe_response(&parts),
        });

        let copied = match copy_head(&parts, sink) {
            Ok(()) => self.copy_body(body, sink).await,
            Err(e) => CopyOutcome::Failed(Error::relay(e.to_string())),
        };
        match copied {
            CopyOutcome::Completed => TranslationOutcome::Completed,
            CopyOutcome::Failed(e) => {
                tracing::warn!(url = %forwarded.url, error = %e, "Error tunneling response");
                self.events.emit(TunnelEvent::ResponseError {
                    request: forwarded,
                    error: Arc::new(e),
                });
                TranslationOutcome::ResponseFailed
            }
            CopyOutcome::Canceled => {
                response::tunnel_closing(sink);
                TranslationOutcome::Closing
            }
        }
    }

    fn request_failed(
        &self,
        request: &RequestDescriptor,
        error: Error,
        sink: &mut ResponseSink,
    ) -> TranslationOutcome {
        tracing::warn!(method = %request.method, url = %request.url, error = %error, "Error tunneling request");
        self.events.emit(TunnelEvent::RequestError {
            request: request.clone(),
            error: Arc::new(error),
        });
        response::error_tunneling_request(sink);
        TranslationOutcome::RequestFailed
    }

    async fn copy_body(&self, mut body: Incoming, sink: &mut ResponseSink) -> CopyOutcome {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return CopyOutcome::Canceled,
                frame = body.frame() => frame,
            };
            let frame = match frame {
                None => return CopyOutcome::Completed,
                Some(Err(e)) => return CopyOutcome::Failed(Error::Http(e)),
                Some(Ok(frame)) => frame,
            };
            // Trailers have nowhere to go on the sink.
            let Ok(data) = frame.into_data() else {
                continue;
            };
            if data.is_empty() {
                continue;
            }

            let written = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return CopyOutcome::Canceled,
                written = sink.write(data) => written,
            };
            if let Err(e) = written {
                return CopyOutcome::Failed(Error::relay(format!(
                    "Failed to relay response body: {}",
                    e
                )));
            }
        }
    }
}

fn describe_response(parts: &Parts) -> ResponseDescriptor {
    let content_length = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    ResponseDescriptor {
        status: parts.status,
        reason: reason_phrase(parts),
        content_length,
    }
}

/// The target's own reason phrase, or the canonical one for its status.
fn reason_phrase(parts: &Parts) -> Option<String> {
    parts
        .extensions
        .get::<ReasonPhrase>()
        .and_then(|phrase| std::str::from_utf8(phrase.as_bytes()).ok())
        .map(str::to_string)
        .or_else(|| parts.status.canonical_reason().map(str::to_string))
}

/// Status, reason and headers of the target response, in the target's order.
fn copy_head(parts: &Parts, sink: &mut ResponseSink) -> std::result::Result<(), SinkError> {
    sink.set_status(parts.status)?;
    if let Some(reason) = reason_phrase(parts) {
        sink.set_status_description(reason)?;
    }
    for (name, value) in parts.headers.iter() {
        if classify(name.as_str()) == HeaderTreatment::Suppressed {
            continue;
        }
        sink.append_header(name.clone(), value.clone())?;
    }
    Ok(())
}

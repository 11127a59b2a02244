//! Synthetic responses written when a request cannot be tunneled.
//!
//! Both are a bare 500 whose reason phrase says what went wrong; no body is
//! written.

use crate::relay::ResponseSink;

/// Reason phrase used when the target could not be reached.
pub const ERROR_TUNNELING_REQUEST: &str = "ikspoz: Error tunneling request";

/// Reason phrase used when the tunnel shut down mid-request.
pub const TUNNEL_CLOSING: &str = "ikspoz: Tunnel closing";

/// Turn the sink into an "Error tunneling request" response.
pub fn error_tunneling_request(sink: &mut ResponseSink) {
    fail(sink, ERROR_TUNNELING_REQUEST);
}

/// Turn the sink into a "Tunnel closing" response, if its head is still unsent.
pub fn tunnel_closing(sink: &mut ResponseSink) {
    fail(sink, TUNNEL_CLOSING);
}

fn fail(sink: &mut ResponseSink, reason: &str) {
    if let Err(e) = sink.fail(reason) {
        tracing::debug!(reason, error = %e, "Response already under way, cannot replace status");
    }
}

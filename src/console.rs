//! Terminal rendering of tunnel events.

use std::io::Write;

use crate::events::{EventStream, TunnelEvent};

const BANNER: &str = r"
                            ██████╗
                            ╚═════╝
██╗██╗  ██╗███████╗██████╗  ██████╗ ███████╗
██║██║ ██╔╝██╔════╝██╔══██╗██╔═══██╗╚══███╔╝
██║█████╔╝ ███████╗██████╔╝██║   ██║  ███╔╝
██║██╔═██╗ ╚════██║██╔═══╝ ██║   ██║ ███╔╝
██║██║  ██╗███████║██║     ╚██████╔╝███████╗
╚═╝╚═╝  ╚═╝╚══════╝╚═╝      ╚═════╝ ╚══════╝";

/// Application banner with the crate version underneath.
pub fn banner() -> String {
    format!("{}\nv{}\n", BANNER, env!("CARGO_PKG_VERSION"))
}

/// Renders [`TunnelEvent`]s as console lines.
#[derive(Debug, Clone, Copy)]
pub struct Console {
    log_requests: bool,
}

impl Default for Console {
    fn default() -> Self {
        Self { log_requests: true }
    }
}

impl Console {
    /// With `log_requests` off, only lifecycle events and errors are shown.
    pub fn new(log_requests: bool) -> Self {
        Self { log_requests }
    }

    /// Text for one event, or `None` if it is not shown.
    pub fn render(&self, event: &TunnelEvent) -> Option<String> {
        let text = match event {
            TunnelEvent::Connecting => "Connecting...".to_string(),
            TunnelEvent::Connected { public_url } => format!(
                "Connected!\n\nYou can begin sending requests to the following public endpoint:\n\t{}\n",
                public_url
            ),
            // The forwarded request carries the target URL, which is the useful one.
            TunnelEvent::RequestReceived { .. } => return None,
            TunnelEvent::RequestForwarded { request } => {
                if !self.log_requests {
                    return None;
                }
                format!("-> Tunneling request: {}", request)
            }
            TunnelEvent::ResponseReceived { response, .. } => {
                if !self.log_requests {
                    return None;
                }
                let status = match &response.reason {
                    Some(reason) => format!("{} {}", response.status.as_u16(), reason),
                    None => response.status.as_u16().to_string(),
                };
                match response.content_length {
                    Some(length) => format!("<- Tunneling response: {} ({} bytes)", status, length),
                    // Chunked and HTTP/2 responses may not announce a length.
                    None => format!("<- Tunneling response: {} (unknown size)", status),
                }
            }
            TunnelEvent::RequestError { request, error } => {
                format!("Error tunneling request: {}\n{}", request, error)
            }
            TunnelEvent::ResponseError { request, error } => {
                format!("Error tunneling response: {}\n{}", request, error)
            }
            TunnelEvent::Closing => "\nClosing connection...".to_string(),
            TunnelEvent::Closed => "Connection closed!".to_string(),
        };
        Some(text)
    }

    /// Print events to `out` until every emitter is gone.
    pub async fn run<W: Write>(&self, mut events: EventStream, mut out: W) -> std::io::Result<()> {
        while let Some(event) = events.recv().await {
            if let Some(line) = self.render(&event) {
                writeln!(out, "{}", line)?;
                out.flush()?;
            }
        }
        Ok(())
    }
}

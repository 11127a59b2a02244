//! Tunnel lifecycle: opening the relay channel, dispatching requests, and
//! shutting everything down again.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use url::Url;

use super::client::TargetClient;
use super::translator::{target_base, RequestTranslator};
use crate::error::{Error, Result};
use crate::events::{EventEmitter, TunnelEvent};
use crate::relay::{ChannelError, ConnectionString, RelayChannel, RelayConnector, RequestHandler};

/// Lifecycle state of a [`TunnelEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Opening => "opening",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Owns one relay channel and forwards everything it receives to the target.
///
/// `open` and `close` take `&mut self`: the lifecycle has a single owner and
/// is not reentrant. Requests are translated on their own tasks and only
/// share the target, the client and the shutdown token.
pub struct TunnelEngine {
    connector: Arc<dyn RelayConnector>,
    target: Url,
    client: Arc<TargetClient>,
    events: EventEmitter,
    state: ConnectionState,
    channel: Option<Box<dyn RelayChannel>>,
    shutdown: CancellationToken,
}

impl TunnelEngine {
    /// Create a closed engine forwarding to `target`.
    pub fn new(connector: Arc<dyn RelayConnector>, target: &Url) -> Result<Self> {
        Ok(Self {
            connector,
            target: target_base(target)?,
            client: Arc::new(TargetClient::new()),
            events: EventEmitter::disabled(),
            state: ConnectionState::Closed,
            channel: None,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_client(mut self, client: TargetClient) -> Self {
        self.client = Arc::new(client);
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Target base URL, always ending in `/`.
    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Public URL of the open channel.
    pub fn public_url(&self) -> Option<Url> {
        self.channel.as_ref().map(|channel| channel.public_url())
    }

    /// Open the relay channel and start tunneling. Only valid while closed;
    /// on failure the engine is closed again.
    pub async fn open(&mut self, connection: &ConnectionString) -> Result<Url> {
        if self.state != ConnectionState::Closed {
            return Err(Error::illegal_state("open", self.state));
        }
        self.state = ConnectionState::Opening;
        self.events.emit(TunnelEvent::Connecting);
        tracing::debug!(connection = %connection, "Opening relay channel");

        let channel = match self.connector.open(connection).await {
            Ok(channel) => channel,
            Err(e) => {
                self.state = ConnectionState::Closed;
                tracing::warn!(error = %e, "Failed to open relay channel");
                return Err(match e {
                    ChannelError::NotFound(detail) => Error::ChannelNotFound(detail),
                    ChannelError::Other(detail) => Error::OpenFailed(detail),
                });
            }
        };

        self.shutdown = CancellationToken::new();
        let translator = RequestTranslator::new(
            &self.target,
            channel.address().clone(),
            self.client.clone(),
            self.events.clone(),
            self.shutdown.clone(),
        );
        let translator = match translator {
            Ok(translator) => Arc::new(translator),
            Err(e) => {
                let mut channel = channel;
                if let Err(close_err) = channel.close().await {
                    tracing::debug!(error = %close_err, "Failed to close channel after setup error");
                }
                self.state = ConnectionState::Closed;
                return Err(e);
            }
        };

        channel.register_handler(dispatcher(translator));
        let public_url = channel.public_url();
        self.channel = Some(channel);
        self.state = ConnectionState::Open;

        tracing::info!(public_url = %public_url, target = %self.target, "Tunnel open");
        self.events.emit(TunnelEvent::Connected {
            public_url: public_url.clone(),
        });
        Ok(public_url)
    }

    /// Stop tunneling. In-flight translations are canceled; the call returns
    /// once the channel itself has shut down. Only valid while open.
    pub async fn close(&mut self) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Err(Error::illegal_state("close", self.state));
        }
        self.state = ConnectionState::Closing;
        self.events.emit(TunnelEvent::Closing);
        self.shutdown.cancel();

        let result = match self.channel.take() {
            Some(mut channel) => channel
                .close()
                .await
                .map_err(|e| Error::CloseFailed(e.to_string())),
            None => Ok(()),
        };

        self.state = ConnectionState::Closed;
        tracing::info!("Tunnel closed");
        self.events.emit(TunnelEvent::Closed);
        result
    }
}

impl Drop for TunnelEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// One spawned translation per inbound request; nothing is queued or joined.
fn dispatcher(translator: Arc<RequestTranslator>) -> RequestHandler {
    Arc::new(move |request, sink| {
        let translator = translator.clone();
        tokio::spawn(async move {
            translator.translate(request, sink).await;
        });
    })
}

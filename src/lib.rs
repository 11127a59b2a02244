//! ikspoz - expose a local HTTP server through a relayed public endpoint
//!
//! A [`TunnelEngine`] opens a relay channel, receives every request sent to
//! the channel's public URL, and forwards it to a fixed target base URL,
//! streaming the target's response back the same way.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ikspoz::{ConnectionString, LocalRelayConnector, TunnelEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let target = url::Url::parse("http://localhost:3000/")?;
//!     let connection = ConnectionString::parse("Endpoint=http://127.0.0.1:8080/;Entity=ikspoz")?;
//!     let mut engine = TunnelEngine::new(Arc::new(LocalRelayConnector), &target)?;
//!     let public_url = engine.open(&connection).await?;
//!     println!("Tunneling {} -> {}", public_url, target);
//!     tokio::signal::ctrl_c().await?;
//!     engine.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod console;
pub mod error;
pub mod events;
pub mod relay;
pub mod settings;
pub mod tunnel;

pub use config::Config;
pub use error::{Error, Result};
pub use events::{EventEmitter, EventStream, TunnelEvent};
pub use relay::{ConnectionString, LocalRelayConnector, RelayChannel, RelayConnector};
pub use settings::{FileSystemSettingsManager, UserSettings, UserSettingsManager};
pub use tunnel::{ConnectionState, TargetClient, TunnelEngine};

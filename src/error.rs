//! Error types for ikspoz

use std::io;

use crate::tunnel::ConnectionState;

/// Main error type for the tunnel
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid connection string: {0}")]
    ConnectionString(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Relay channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Failed to open relay channel: {0}")]
    OpenFailed(String),

    #[error("Failed to close relay channel: {0}")]
    CloseFailed(String),

    #[error("Cannot {operation} a tunnel that is {state}")]
    IllegalStateTransition {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn settings(msg: impl Into<String>) -> Self {
        Error::Settings(msg.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    pub fn invalid_url(msg: impl Into<String>) -> Self {
        Error::InvalidUrl(msg.into())
    }

    pub fn connection_string(msg: impl Into<String>) -> Self {
        Error::ConnectionString(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Error::Upstream(msg.into())
    }

    pub fn relay(msg: impl Into<String>) -> Self {
        Error::Relay(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn illegal_state(operation: &'static str, state: ConnectionState) -> Self {
        Error::IllegalStateTransition { operation, state }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

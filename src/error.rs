use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the tunnel engine.
///
/// `Credential`, `Connect`, `Authentication`, `Bind` and a transport-level
/// `Channel` failure end the whole run. `LocalConnect` and `Io` are scoped to a
/// single relayed connection.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to load key {path:?}: {message}")]
    Credential { path: PathBuf, message: String },

    #[error("Connection to relay host failed: {0}")]
    Connect(String),

    #[error("Authentication as {user} was rejected: {message}")]
    Authentication { user: String, message: String },

    #[error("Relay refused to bind remote port {port}: {message}")]
    Bind { port: u16, message: String },

    #[error("Forwarding request to {host}:{port} failed: {source}")]
    LocalConnect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("SSH channel error: {0}")]
    Channel(String),

    #[error("Invalid port number: {0}")]
    InvalidPort(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Whether this error ends the whole run rather than a single connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::LocalConnect { .. } | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

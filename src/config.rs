//! Parameters handed to the tunnel engine by its callers.

use crate::error::{Result, TunnelError};
use std::path::PathBuf;
use std::time::Duration;

/// Relay host every tunnel is opened against.
pub const REMOTE_HOST: &str = "ssh.ezdemo.org";

/// SSH port of the relay host.
pub const CONTROL_PORT: u16 = 2222;

/// Local service host. Tunnels only ever reach the loopback interface.
pub const LOCAL_HOST: &str = "127.0.0.1";

/// Local port used when the caller does not name one.
pub const DEFAULT_LOCAL_PORT: u16 = 80;

/// Everything needed to bring up one reverse tunnel.
#[derive(Debug, Clone)]
pub struct TunnelParams {
    pub remote_host: String,
    pub control_port: u16,
    pub username: String,
    pub credential_path: PathBuf,
    pub remote_bind_port: u16,
    pub local_host: String,
    pub local_port: u16,
}

impl TunnelParams {
    pub fn new(
        username: impl Into<String>,
        credential_path: impl Into<PathBuf>,
        remote_bind_port: u16,
        local_port: u16,
    ) -> Self {
        Self {
            remote_host: REMOTE_HOST.to_string(),
            control_port: CONTROL_PORT,
            username: username.into(),
            credential_path: credential_path.into(),
            remote_bind_port,
            local_host: LOCAL_HOST.to_string(),
            local_port,
        }
    }

    /// Reject port 0 for any of the three ports before any network activity.
    ///
    /// Library callers that want the relay to pick the remote port skip this
    /// and pass a bind port of 0 to [`crate::ssh::request_bind`] directly.
    pub fn validate(&self) -> Result<()> {
        let ports = [
            ("remote", self.remote_bind_port),
            ("local", self.local_port),
            ("control", self.control_port),
        ];
        match ports.iter().find(|(_, port)| *port == 0) {
            Some((which, port)) => Err(TunnelError::InvalidPort(format!("{} port {}", which, port))),
            None => Ok(()),
        }
    }
}

/// Parse and range-check a port number.
pub fn validate_port(port: &str) -> Result<u16> {
    let value: u32 = port
        .trim()
        .parse()
        .map_err(|_| TunnelError::InvalidPort(port.to_string()))?;

    if (1..=65535).contains(&value) {
        Ok(value as u16)
    } else {
        Err(TunnelError::InvalidPort(port.to_string()))
    }
}

/// Tuning for the SSH transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub keepalive_interval: Option<Duration>,
    pub keepalive_max: usize,
    pub inactivity_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Some(Duration::from_secs(15)),
            keepalive_max: 3,
            inactivity_timeout: None,
        }
    }
}

/// Tuning for per-connection relays and the accept loop.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bytes read per suspension in each direction.
    pub buffer_size: usize,
    /// Upper bound on how long any read or accept waits before cancellation is
    /// checked again.
    pub poll_interval: Duration,
    pub local_connect_timeout: Duration,
    /// How long shutdown waits for in-flight relays before aborting them.
    pub drain_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            poll_interval: Duration::from_secs(1),
            local_connect_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(1),
        }
    }
}

impl RelayConfig {
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            drain_timeout: poll_interval,
            ..Default::default()
        }
    }
}

use crate::config::{TransportConfig, TunnelParams};
use crate::error::{Result, TunnelError};
use crate::ssh::handler::{ClientHandler, InboundChannel};
use russh::client::{self, Handle};
use russh::keys::{load_secret_key, PrivateKey, PrivateKeyWithHashAlg};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The single authenticated SSH connection to the relay host.
///
/// Every tunnel channel is multiplexed over this connection. Only its owner
/// may close it, and closing twice is a no-op.
pub struct Session {
    remote_host: String,
    control_port: u16,
    username: String,
    credential_path: PathBuf,
    handle: Handle<ClientHandler>,
    inbound_rx: Option<mpsc::UnboundedReceiver<InboundChannel>>,
    closed: bool,
}

impl Session {
    /// Load the credential, connect to the relay host and authenticate.
    ///
    /// The key is parsed before any network activity so a bad credential is
    /// reported without touching the relay.
    pub async fn open(params: &TunnelParams, transport: &TransportConfig) -> Result<Self> {
        let key = load_credential(&params.credential_path)?;

        info!(
            "Connecting to {}@{}:{}",
            params.username, params.remote_host, params.control_port
        );

        let addr = resolve(&params.remote_host, params.control_port, transport).await?;

        let stream = tokio::time::timeout(transport.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                TunnelError::Connect(format!(
                    "timed out connecting to {} after {:?}",
                    addr, transport.connect_timeout
                ))
            })?
            .map_err(|e| TunnelError::Connect(format!("TCP connection to {} failed: {}", addr, e)))?;

        let russh_config = Arc::new(client::Config {
            inactivity_timeout: transport.inactivity_timeout,
            keepalive_interval: transport.keepalive_interval,
            keepalive_max: transport.keepalive_max,
            ..Default::default()
        });

        let (handler, inbound_rx) = ClientHandler::new();

        let mut handle = client::connect_stream(russh_config, stream, handler)
            .await
            .map_err(|e| TunnelError::Connect(format!("SSH handshake failed: {}", e)))?;

        let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), None);
        let auth_result = handle
            .authenticate_publickey(&params.username, key_with_alg)
            .await
            .map_err(|e| TunnelError::Authentication {
                user: params.username.clone(),
                message: e.to_string(),
            })?;

        if !auth_result.success() {
            return Err(TunnelError::Authentication {
                user: params.username.clone(),
                message: format!("key {:?} not accepted", params.credential_path),
            });
        }

        info!("Authenticated as {} via {:?}", params.username, params.credential_path);

        Ok(Self {
            remote_host: params.remote_host.clone(),
            control_port: params.control_port,
            username: params.username.clone(),
            credential_path: params.credential_path.clone(),
            handle,
            inbound_rx: Some(inbound_rx),
            closed: false,
        })
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn credential_path(&self) -> &Path {
        &self.credential_path
    }

    /// Whether the transport is gone, either closed locally or dropped by the
    /// relay host.
    pub fn is_closed(&self) -> bool {
        self.closed || self.handle.is_closed()
    }

    pub(crate) fn handle_mut(&mut self) -> &mut Handle<ClientHandler> {
        &mut self.handle
    }

    /// Hand out the inbound channel queue. There is only one, so only the
    /// first forward binding on a session receives it.
    pub(crate) fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<InboundChannel>> {
        self.inbound_rx.take()
    }

    /// Disconnect from the relay host.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.handle.is_closed() {
            debug!("Transport already closed by relay host");
            return Ok(());
        }

        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            // The peer may already be gone; there is nothing left to release.
            warn!("Error while disconnecting from relay host: {}", e);
        }

        info!("Disconnected from {}:{}", self.remote_host, self.control_port);
        Ok(())
    }
}

/// Read and parse the private key.
pub fn load_credential(path: &Path) -> Result<PrivateKey> {
    if !path.is_file() {
        return Err(TunnelError::Credential {
            path: path.to_path_buf(),
            message: "file not found".to_string(),
        });
    }

    load_secret_key(path, None).map_err(|e| TunnelError::Credential {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

async fn resolve(host: &str, port: u16, transport: &TransportConfig) -> Result<SocketAddr> {
    let target = format!("{}:{}", host, port);

    let mut addrs = tokio::time::timeout(transport.connect_timeout, tokio::net::lookup_host(&target))
        .await
        .map_err(|_| TunnelError::Connect(format!("timed out resolving {}", target)))?
        .map_err(|e| TunnelError::Connect(format!("Failed to resolve host {}: {}", target, e)))?;

    addrs
        .next()
        .ok_or_else(|| TunnelError::Connect(format!("Could not resolve host address {}", target)))
}

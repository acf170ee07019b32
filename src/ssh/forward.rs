use crate::error::{Result, TunnelError};
use crate::ssh::handler::InboundChannel;
use crate::ssh::session::Session;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Address the relay host binds the forwarded port on.
pub const BIND_ADDRESS: &str = "0.0.0.0";

/// A remote port the relay host listens on for us.
///
/// Only meaningful while the [`Session`] that created it is alive.
pub struct ForwardBinding {
    remote_bind_port: u16,
    inbound_rx: mpsc::UnboundedReceiver<InboundChannel>,
}

impl ForwardBinding {
    pub fn remote_bind_port(&self) -> u16 {
        self.remote_bind_port
    }

    /// Wait up to `timeout` for the next tunnel channel.
    ///
    /// `Ok(None)` means nothing arrived in time and the caller should re-check
    /// cancellation. An error means the transport is gone and no further
    /// channels will ever arrive.
    pub async fn accept_next(&mut self, timeout: Duration) -> Result<Option<InboundChannel>> {
        loop {
            let inbound = match tokio::time::timeout(timeout, self.inbound_rx.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => {
                    return Err(TunnelError::Channel(
                        "transport closed, no more tunnel channels".to_string(),
                    ))
                }
                Ok(Some(inbound)) => inbound,
            };

            if inbound.connected_port != u32::from(self.remote_bind_port) {
                warn!(
                    "Rejecting channel for unexpected port {} (bound {})",
                    inbound.connected_port, self.remote_bind_port
                );
                let _ = inbound.channel.close().await;
                continue;
            }

            debug!(
                "Accepted tunnel channel from {}:{}",
                inbound.originator_address, inbound.originator_port
            );
            return Ok(Some(inbound));
        }
    }
}

/// Ask the relay host to listen on `remote_bind_port` and forward every
/// connection back over `session`.
///
/// A bind port of 0 lets the relay choose; the binding records whatever port
/// it reports. [`TunnelParams::validate`](crate::TunnelParams::validate)
/// rejects 0, so only callers that skip it reach that path.
pub async fn request_bind(session: &mut Session, remote_bind_port: u16) -> Result<ForwardBinding> {
    let assigned = session
        .handle_mut()
        .tcpip_forward(BIND_ADDRESS, u32::from(remote_bind_port))
        .await
        .map_err(|e| TunnelError::Bind {
            port: remote_bind_port,
            message: e.to_string(),
        })?;

    let remote_bind_port = if assigned != 0 {
        u16::try_from(assigned).map_err(|_| TunnelError::Bind {
            port: remote_bind_port,
            message: format!("relay assigned out-of-range port {}", assigned),
        })?
    } else {
        remote_bind_port
    };

    let inbound_rx = session.take_inbound().ok_or_else(|| TunnelError::Bind {
        port: remote_bind_port,
        message: "session already has a forward binding".to_string(),
    })?;

    info!(
        "Relay {} listening on remote port {}",
        session.remote_host(),
        remote_bind_port
    );

    Ok(ForwardBinding {
        remote_bind_port,
        inbound_rx,
    })
}

/// Withdraw the remote listener. Failures are logged; the transport is about
/// to be torn down anyway.
pub async fn cancel_bind(session: &mut Session, binding: &ForwardBinding) {
    if session.is_closed() {
        return;
    }

    if let Err(e) = session
        .handle_mut()
        .cancel_tcpip_forward(BIND_ADDRESS, u32::from(binding.remote_bind_port))
        .await
    {
        debug!(
            "Failed to cancel remote forward on port {}: {}",
            binding.remote_bind_port, e
        );
    }
}

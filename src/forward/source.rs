use crate::config::{TransportConfig, TunnelParams};
use crate::error::{Result, TunnelError};
use crate::ssh::{cancel_bind, request_bind, ForwardBinding, Session};
use async_trait::async_trait;
use russh::client::Msg;
use russh::ChannelStream;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

/// A tunnel channel ready to be relayed.
pub struct Accepted<S> {
    pub stream: S,
    /// Who connected to the forwarded port, as reported by the relay host.
    pub peer: String,
}

/// Where inbound tunnel channels come from.
///
/// The coordinator only needs a bounded-wait accept and a final close, so it
/// can drive an SSH tunnel or anything else that hands out byte streams.
#[async_trait]
pub trait ChannelSource: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait at most `timeout` for the next channel. `Ok(None)` on timeout.
    async fn accept_next(&mut self, timeout: Duration) -> Result<Option<Accepted<Self::Stream>>>;

    /// Release the underlying transport. Called once, after every relay is
    /// done.
    async fn close(&mut self) -> Result<()>;
}

/// An authenticated session with its remote port forward in place.
pub struct SshTunnel {
    session: Session,
    binding: ForwardBinding,
}

impl SshTunnel {
    /// Open the session and request the remote bind. If the bind is refused
    /// the session is closed before the error is returned.
    pub async fn establish(params: &TunnelParams, transport: &TransportConfig) -> Result<Self> {
        let mut session = Session::open(params, transport).await?;

        let binding = match request_bind(&mut session, params.remote_bind_port).await {
            Ok(binding) => binding,
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    warn!("Failed to close session after bind error: {}", close_err);
                }
                return Err(e);
            }
        };

        Ok(Self { session, binding })
    }

    pub fn remote_bind_port(&self) -> u16 {
        self.binding.remote_bind_port()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

#[async_trait]
impl ChannelSource for SshTunnel {
    type Stream = ChannelStream<Msg>;

    async fn accept_next(&mut self, timeout: Duration) -> Result<Option<Accepted<Self::Stream>>> {
        let accepted = self.binding.accept_next(timeout).await?;

        match accepted {
            Some(inbound) => Ok(Some(Accepted {
                peer: format!("{}:{}", inbound.originator_address, inbound.originator_port),
                stream: inbound.channel.into_stream(),
            })),
            None if self.session.is_closed() => Err(TunnelError::Channel(
                "connection to relay host lost".to_string(),
            )),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        cancel_bind(&mut self.session, &self.binding).await;
        self.session.close().await
    }
}

use russh::client::{self, Msg, Session};
use russh::keys::PublicKey;
use russh::Channel;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A tunnel channel the relay host opened because an external client
/// connected to the forwarded port.
pub struct InboundChannel {
    pub channel: Channel<Msg>,
    pub connected_address: String,
    pub connected_port: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

impl std::fmt::Debug for InboundChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundChannel")
            .field("channel", &self.channel.id())
            .field("connected", &format!("{}:{}", self.connected_address, self.connected_port))
            .field("originator", &format!("{}:{}", self.originator_address, self.originator_port))
            .finish()
    }
}

/// russh callbacks for the relay connection.
///
/// Forwarded channels are handed to the accept side through an unbounded
/// queue so the session loop never waits on a slow consumer.
pub struct ClientHandler {
    inbound_tx: mpsc::UnboundedSender<InboundChannel>,
}

impl ClientHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<InboundChannel>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (Self { inbound_tx }, inbound_rx)
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        // The relay host is a fixed, operator-controlled endpoint: trust its
        // key on first sight, like `ssh -o StrictHostKeyChecking=no`.
        debug!(
            algorithm = ?server_public_key.algorithm(),
            "accepting relay host key"
        );
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Forwarded channel from {}:{} for {}:{}",
            originator_address, originator_port, connected_address, connected_port
        );

        let inbound = InboundChannel {
            channel,
            connected_address: connected_address.to_string(),
            connected_port,
            originator_address: originator_address.to_string(),
            originator_port,
        };

        if let Err(mpsc::error::SendError(rejected)) = self.inbound_tx.send(inbound) {
            warn!(
                "No listener for forwarded channel on port {}, closing it",
                rejected.connected_port
            );
            let _ = rejected.channel.close().await;
        }

        Ok(())
    }
}

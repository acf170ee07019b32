use crate::config::RelayConfig;
use crate::error::{Result, TunnelError};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Lifecycle of one relayed connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RelayState {
    /// Channel accepted, local service not yet connected.
    Pending,
    /// Both endpoints connected, bytes flowing.
    Active,
    /// End-of-stream, error or cancellation seen; endpoints being shut down.
    Closing,
    /// Terminal.
    Closed,
}

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The tunnel channel reached end-of-stream.
    RemoteEof,
    /// The local service closed its side.
    LocalEof,
    /// Reading or writing the tunnel channel failed.
    RemoteError,
    /// Reading or writing the local socket failed.
    LocalError,
    /// The cancellation signal was observed.
    Cancelled,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteEof => write!(f, "remote end-of-stream"),
            Self::LocalEof => write!(f, "local end-of-stream"),
            Self::RemoteError => write!(f, "remote I/O error"),
            Self::LocalError => write!(f, "local I/O error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Summary of a finished relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub id: u64,
    pub reason: CloseReason,
    /// Bytes copied from the tunnel channel to the local service.
    pub to_local: u64,
    /// Bytes copied from the local service to the tunnel channel.
    pub to_remote: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ToLocal,
    ToRemote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    Eof,
    ReadError,
    WriteError,
    Stopped,
}

/// Bidirectional byte pump between one tunnel channel and one local TCP
/// connection.
///
/// Each direction runs its own read loop so a stall on one side never holds
/// up the other. Every read waits at most `poll_interval` before the
/// cancellation signal is checked again.
pub struct ChannelRelay {
    id: u64,
    config: RelayConfig,
    cancel: CancellationToken,
    state: RelayState,
}

impl ChannelRelay {
    pub fn new(id: u64, config: RelayConfig, cancel: CancellationToken) -> Self {
        Self {
            id,
            config,
            cancel,
            state: RelayState::Pending,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    fn transition(&mut self, next: RelayState) {
        if next <= self.state {
            return;
        }
        trace!(relay = self.id, "{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Connect to the local service and relay until either side finishes or
    /// cancellation is observed.
    ///
    /// A local connection failure closes the channel and is returned as
    /// [`TunnelError::LocalConnect`]; it never affects other relays.
    pub async fn run<S>(
        mut self,
        mut channel: S,
        local_host: &str,
        local_port: u16,
    ) -> Result<RelayOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let connect = tokio::time::timeout(
            self.config.local_connect_timeout,
            TcpStream::connect((local_host, local_port)),
        );

        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            connected = connect => Some(connected),
        };

        let local = match connected {
            None => {
                self.close_pending(&mut channel).await;
                return Ok(RelayOutcome {
                    id: self.id,
                    reason: CloseReason::Cancelled,
                    to_local: 0,
                    to_remote: 0,
                });
            }
            Some(Ok(Ok(stream))) => stream,
            Some(Ok(Err(source))) => {
                self.close_pending(&mut channel).await;
                return Err(TunnelError::LocalConnect {
                    host: local_host.to_string(),
                    port: local_port,
                    source,
                });
            }
            Some(Err(_)) => {
                self.close_pending(&mut channel).await;
                return Err(TunnelError::LocalConnect {
                    host: local_host.to_string(),
                    port: local_port,
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("no answer within {:?}", self.config.local_connect_timeout),
                    ),
                });
            }
        };

        let _ = local.set_nodelay(true);
        debug!(relay = self.id, "Connected to {}:{}", local_host, local_port);

        Ok(self.relay(channel, local).await)
    }

    /// Pump bytes between two already-connected endpoints.
    pub async fn relay<R, L>(&mut self, remote: R, local: L) -> RelayOutcome
    where
        R: AsyncRead + AsyncWrite,
        L: AsyncRead + AsyncWrite,
    {
        self.transition(RelayState::Active);

        let (remote_read, remote_write) = tokio::io::split(remote);
        let (local_read, local_write) = tokio::io::split(local);

        // Either direction finishing stops the other one.
        let closing = self.cancel.child_token();

        let to_local = pump(
            self.id,
            Direction::ToLocal,
            remote_read,
            local_write,
            self.config.buffer_size,
            self.config.poll_interval,
            closing.clone(),
        );
        let to_remote = pump(
            self.id,
            Direction::ToRemote,
            local_read,
            remote_write,
            self.config.buffer_size,
            self.config.poll_interval,
            closing.clone(),
        );

        let ((local_end, to_local), (remote_end, to_remote)) = tokio::join!(to_local, to_remote);

        self.transition(RelayState::Closing);

        let reason = if self.cancel.is_cancelled() {
            CloseReason::Cancelled
        } else {
            first_reason(
                (Direction::ToLocal, &local_end),
                (Direction::ToRemote, &remote_end),
            )
        };

        debug!(
            relay = self.id,
            to_local, to_remote, "Relay closed: {}", reason
        );

        self.transition(RelayState::Closed);

        RelayOutcome {
            id: self.id,
            reason,
            to_local,
            to_remote,
        }
    }

    async fn close_pending<S>(&mut self, channel: &mut S)
    where
        S: AsyncWrite + Unpin,
    {
        self.transition(RelayState::Closing);
        close_quietly(channel).await;
        self.transition(RelayState::Closed);
    }
}

/// Copy `reader` into `writer` one buffer at a time until end-of-stream, an
/// error, or `closing` fires. Data already read is always written out before
/// the loop looks at `closing` again.
async fn pump<R, W>(
    relay_id: u64,
    direction: Direction,
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    poll_interval: Duration,
    closing: CancellationToken,
) -> (PumpEnd, u64)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut copied = 0u64;

    let end = loop {
        tokio::select! {
            biased;

            _ = closing.cancelled() => break PumpEnd::Stopped,

            read = tokio::time::timeout(poll_interval, reader.read(&mut buf)) => {
                match read {
                    // Poll tick: nothing arrived, re-check cancellation.
                    Err(_) => continue,
                    Ok(Ok(0)) => break PumpEnd::Eof,
                    Ok(Ok(n)) => {
                        if let Err(e) = writer.write_all(&buf[..n]).await {
                            debug!(relay = relay_id, ?direction, "Write failed: {}", e);
                            break PumpEnd::WriteError;
                        }
                        copied += n as u64;
                    }
                    Ok(Err(e)) => {
                        debug!(relay = relay_id, ?direction, "Read failed: {}", e);
                        break PumpEnd::ReadError;
                    }
                }
            }
        }
    };

    closing.cancel();
    close_quietly(&mut writer).await;

    (end, copied)
}

/// Flush and shut down a write half. Errors are expected when the peer is
/// already gone and are ignored, so closing twice is harmless.
async fn close_quietly<W>(writer: &mut W)
where
    W: AsyncWrite + Unpin,
{
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}

fn first_reason(to_local: (Direction, &PumpEnd), to_remote: (Direction, &PumpEnd)) -> CloseReason {
    // The pump that did not stop on `closing` is the one that ended the relay.
    let (direction, end) = match to_local.1 {
        PumpEnd::Stopped => to_remote,
        _ => to_local,
    };

    match (direction, end) {
        (Direction::ToLocal, PumpEnd::Eof) => CloseReason::RemoteEof,
        (Direction::ToLocal, PumpEnd::ReadError) => CloseReason::RemoteError,
        (Direction::ToLocal, PumpEnd::WriteError) => CloseReason::LocalError,
        (Direction::ToRemote, PumpEnd::Eof) => CloseReason::LocalEof,
        (Direction::ToRemote, PumpEnd::ReadError) => CloseReason::LocalError,
        (Direction::ToRemote, PumpEnd::WriteError) => CloseReason::RemoteError,
        (_, PumpEnd::Stopped) => CloseReason::Cancelled,
    }
}

//! Reverse SSH tunnel engine for ezdemo.
//!
//! This crate provides:
//! - An authenticated SSH session to the relay host
//! - Remote port forward requests and a bounded-wait accept on inbound channels
//! - Per-connection byte relays between tunnel channels and a local service
//! - A coordinator that fans out relays and shuts them down on cancellation

pub mod config;
pub mod error;
pub mod forward;
pub mod logging;
pub mod ssh;

pub use config::{RelayConfig, TransportConfig, TunnelParams};
pub use error::{Result, TunnelError};
pub use forward::{
    Accepted, ChannelRelay, ChannelSource, CloseReason, CoordinatorReport, RelayCoordinator,
    RelayOutcome, RelayState, SshTunnel,
};
pub use ssh::{ForwardBinding, Session};

pub use tokio_util::sync::CancellationToken;

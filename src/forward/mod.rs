pub mod coordinator;
pub mod relay;
pub mod source;

pub use coordinator::{CoordinatorReport, RelayCoordinator};
pub use relay::{ChannelRelay, CloseReason, RelayOutcome, RelayState};
pub use source::{Accepted, ChannelSource, SshTunnel};

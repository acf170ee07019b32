pub mod forward;
pub mod handler;
pub mod session;

pub use forward::{cancel_bind, request_bind, ForwardBinding};
pub use handler::{ClientHandler, InboundChannel};
pub use session::Session;

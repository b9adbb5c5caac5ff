//! WebSocket subscription hub (C8).

pub mod app;
pub mod commands;
pub mod hub;
pub mod protocol;

pub use app::router;
pub use commands::{handle_command, CommandError};
pub use hub::SubscriptionHub;
pub use protocol::{ClientRequest, ProtocolError, ReplayFrom};

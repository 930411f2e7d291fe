//! Bridge — the WebSocket surface game servers and tool callers connect to.
//!
//! - `protocol`: inbound/outbound JSON message types
//! - `server`: accept loop, per-connection reader/writer, message dispatch

pub mod protocol;
pub mod server;

pub use protocol::{InboundMessage, OutboundMessage};
pub use server::{BridgeServer, ServerError};

//! WebSocket transport and wire protocol

pub mod connection;
pub mod handler;
pub mod protocol;

pub use connection::{Outbound, TransportSettings};
pub use protocol::GamePacket;

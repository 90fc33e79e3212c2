//! Game simulation modules

pub mod combat;
pub mod input;
pub mod player;
pub mod registry;
pub mod room;
pub mod snapshot;

pub use player::Player;
pub use registry::{RegistrySettings, RoomRegistry};
pub use room::{Room, RoomCommand, RoomError, RoomHandle, RoomSettings, RoomStatus};

/// Numeric player id assigned by the login service
pub type Uid = u64;

//! Beam Arena room server - authoritative multiplayer arena rooms
//!
//! Clients connect over WebSocket to a room, stream their inputs, and receive
//! a world snapshot every tick. Each room is a single task running a fixed
//! 64 Hz simulation; a process-wide registry creates rooms on demand and
//! reaps idle ones.

pub mod app;
pub mod config;
pub mod game;
pub mod http;
pub mod store;
pub mod util;
pub mod ws;

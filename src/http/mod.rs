//! HTTP surface: health, control RPCs, WebSocket endpoint

pub mod routes;

pub use routes::{build_router, AppError};

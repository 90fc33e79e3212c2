//! Composition of shared services

pub mod state;

pub use state::AppState;

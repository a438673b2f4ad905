//! API server for the shipyard build orchestrator.
//!
//! Receives push notifications and exposes the administrative build
//! operations over HTTP. The scheduler loop runs alongside in the same
//! process.

pub mod bootstrap;
pub mod error;
pub mod routes;
pub mod state;

#[cfg(test)]
mod testing;

pub use state::AppState;

//! Job process supervision for shipyard.
//!
//! Provides the local supervisor that starts every job in its own session,
//! ties its liveness to an exclusive lock on a file, and kills whole
//! process groups.

pub mod local;

pub use local::LocalSupervisor;
pub use shipyard_core::supervisor::{ProcessSpec, Supervisor};

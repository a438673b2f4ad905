//! Build scheduling for the shipyard build orchestrator.
//!
//! Discovers new commits, admits builds onto this host, moves them through
//! the job pipeline and retires them. Processes are supervised through lock
//! files so a tick never waits on a running job.

pub mod actions;
pub mod catalog;
pub mod checkout;
pub mod command;
pub mod context;
pub mod jobs;
pub mod matcher;
pub mod pipeline;
pub mod ports;
pub mod probe;
pub mod proxy;
pub mod result;
pub mod runner;
pub mod scheduler;
pub mod status;
pub mod sync;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use actions::{ask_kill, force, skip};
pub use catalog::{detect_duplicate, discover_builds, on_new_commit, upsert_branch};
pub use context::Context;
pub use matcher::{ClosestBranch, closest_branch};
pub use pipeline::{Job, JobOutcome, PIPELINE};
pub use proxy::FileProxy;
pub use runner::{advance, kill};
pub use scheduler::{Scheduler, TickReport};
pub use sync::sync_repositories;
pub use workspace::BuildDir;

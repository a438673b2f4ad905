//! Core domain types and traits for the shipyard build orchestrator.
//!
//! This crate contains:
//! - Identifiers and the Repository / Branch / Build records
//! - Build states, results and server-match classifications
//! - The seams to external collaborators: record store, git mirror,
//!   code-hosting API, process supervisor, database admin and proxy routes

pub mod branch;
pub mod build;
pub mod database;
pub mod error;
pub mod hosting;
pub mod id;
pub mod proxy;
pub mod repository;
pub mod secret;
pub mod store;
pub mod supervisor;
pub mod vcs;

pub use branch::{Branch, NewBranch};
pub use build::{Build, BuildLogEntry, BuildResult, BuildState, NewBuild, ServerMatch};
pub use database::DatabaseAdmin;
pub use error::{Error, Result};
pub use hosting::{CommitStatus, HostingApi, PullInfo, StatusState};
pub use id::{BranchId, BuildId, RepoId};
pub use proxy::{ProxyRoute, ProxyRoutes};
pub use repository::{ModulesAuto, NewRepository, RepoMode, Repository};
pub use secret::Secret;
pub use store::{BuildFilter, BuildOrder, Store};
pub use supervisor::{ProcessSpec, Supervisor};
pub use vcs::{FetchOutcome, RefInfo, Vcs};

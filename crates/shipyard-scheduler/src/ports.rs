use shipyard_core::{BuildFilter, BuildState, Error, Result};
use std::collections::HashSet;

use crate::Context;

/// Lowest free port from `starting_port`, in steps of two.
///
/// Each build takes its port and the one above it for longpolling.
pub async fn find_port(ctx: &Context) -> Result<u16> {
    let used: HashSet<u16> = ctx
        .store
        .search_builds(&BuildFilter::new().states([
            BuildState::Testing,
            BuildState::Running,
            BuildState::Duplicate,
            BuildState::Deathrow,
        ]))
        .await?
        .iter()
        .filter_map(|b| b.port)
        .collect();

    let mut port = ctx.settings.starting_port;
    while used.contains(&port) {
        port = port
            .checked_add(2)
            .ok_or_else(|| Error::Conflict("no free port left".to_string()))?;
    }
    Ok(port)
}

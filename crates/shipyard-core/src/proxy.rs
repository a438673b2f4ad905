//! Reverse-proxy routing of running builds.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// One running build exposed through the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRoute {
    pub dest: String,
    pub host: String,
    pub port: u16,
}

/// Regenerates and reloads the proxy configuration.
#[async_trait]
pub trait ProxyRoutes: Send + Sync {
    async fn reload(&self, routes: &[ProxyRoute]) -> Result<()>;
}

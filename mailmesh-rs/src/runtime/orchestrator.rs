//! Startup initialization
//!
//! The global `auth_map` table is resolved first, then endpoints are
//! initialized eagerly in declaration order; every module
//! they reach is initialized through the resolver on first reference.
//! Afterwards each declared block must have been initialized.

use super::builder::ModuleGraph;
use crate::error::{MeshError, Result};
use crate::hooks::Event;
use crate::module::Resolver;
use tracing::{info, warn};

/// Initialize endpoints and check that every block was used.
///
/// On failure the shutdown hooks registered so far are fired before the
/// error is returned, so listeners bound by earlier endpoints are released.
pub async fn init_modules(resolver: &Resolver, graph: &ModuleGraph) -> Result<()> {
    let result = init_and_validate(resolver, graph).await;
    if result.is_err() {
        let hooks = resolver.hooks();
        if hooks.count(Event::Shutdown) > 0 {
            warn!("startup failed, releasing initialized modules");
            hooks.run(Event::Shutdown);
        }
    }
    result
}

async fn init_and_validate(resolver: &Resolver, graph: &ModuleGraph) -> Result<()> {
    resolver.init_auth_map().await?;
    for endpoint in &graph.endpoints {
        resolver.init_endpoint(endpoint).await?;
    }

    let registry = resolver.registry();
    for module in graph.endpoints.iter().chain(&graph.modules) {
        let name = module.instance.instance_name();
        if !registry.is_initialized(name) {
            return Err(MeshError::UnusedBlock {
                instance: name.to_string(),
                module: module.instance.name().to_string(),
                location: module.block.location.clone(),
            });
        }
    }

    info!(
        "{} endpoint(s) and {} module(s) initialized",
        graph.endpoints.len(),
        graph.modules.len()
    );
    Ok(())
}

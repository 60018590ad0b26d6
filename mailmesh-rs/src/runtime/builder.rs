//! Module graph construction
//!
//! One instance per top-level block, built in declaration order. Nothing is
//! initialized here; factories only construct.

use crate::config::ConfigNode;
use crate::error::{MeshError, Result};
use crate::module::{Factories, ModInfo, ModuleSpec, Registry};
use tracing::debug;

/// Constructed instances, in declaration order
#[derive(Default, Clone)]
pub struct ModuleGraph {
    pub endpoints: Vec<ModInfo>,
    pub modules: Vec<ModInfo>,
}

fn block_spec(node: &ConfigNode) -> ModuleSpec {
    let instance_name = node.args.first().cloned().unwrap_or_else(|| node.name.clone());
    let aliases = node.args.iter().skip(1).cloned().collect();
    ModuleSpec {
        module_type: node.name.clone(),
        instance_name,
        aliases,
        inline_args: None,
    }
}

/// Construct every block and register module instances.
///
/// Fails on unknown directives, duplicate names and when no endpoint is
/// declared.
pub fn register_modules(
    registry: &Registry,
    factories: &Factories,
    nodes: Vec<ConfigNode>,
) -> Result<ModuleGraph> {
    let mut graph = ModuleGraph::default();

    for node in nodes {
        if let Some(factory) = factories.endpoint(&node.name) {
            let instance = factory(&node.name, &node.args).map_err(|source| MeshError::Construct {
                module: node.name.clone(),
                location: node.location.clone(),
                source,
            })?;
            debug!("{}: endpoint {} constructed", node.location, node.name);
            graph.endpoints.push(ModInfo::new(instance, node));
            continue;
        }

        let Some(factory) = factories.module(&node.name) else {
            return Err(MeshError::UnknownDirective {
                name: node.name.clone(),
                location: node.location.clone(),
            });
        };

        let spec = block_spec(&node);
        for name in std::iter::once(&spec.instance_name).chain(spec.aliases.iter()) {
            if registry.has_instance(name) {
                return Err(MeshError::DuplicateName {
                    name: name.clone(),
                    location: node.location.clone(),
                    previous: registry.location_of(name),
                });
            }
        }

        let instance_name = spec.instance_name.clone();
        let aliases = spec.aliases.clone();
        let instance = factory(spec).map_err(|source| MeshError::Construct {
            module: node.name.clone(),
            location: node.location.clone(),
            source,
        })?;

        let location = node.location.clone();
        let info = ModInfo::new(instance, node);
        registry.register_instance(info.clone())?;
        for alias in &aliases {
            registry.register_alias(alias, &instance_name, &location)?;
        }
        graph.modules.push(info);
    }

    if graph.endpoints.is_empty() {
        return Err(MeshError::NoEndpoint);
    }
    // Endpoints share the initialized set with modules
    for endpoint in &graph.endpoints {
        let name = endpoint.instance.instance_name();
        if registry.has_instance(name) {
            return Err(MeshError::DuplicateName {
                name: name.to_string(),
                location: endpoint.block.location.clone(),
                previous: registry.location_of(name),
            });
        }
    }
    Ok(graph)
}

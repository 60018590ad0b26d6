//! Lazy instance initialization
//!
//! Nothing is sorted up front. When an instance's `init` asks for another
//! instance by name, [`Resolver::resolve`] initializes that instance right
//! away (once) and hands it back, so the dependency graph is walked on
//! demand starting from the endpoints.

use super::{describe, Factories, ModInfo, Module, ModuleSpec, Registry, Storage, Table};
use crate::config::ConfigNode;
use crate::error::{MeshError, Result};
use crate::globals::Globals;
use crate::hooks::{Event, Hooks};
use std::sync::{Arc, OnceLock};
use tracing::{debug, error};

/// Everything lazy initialization needs, shared by every `init` call
#[derive(Clone)]
pub struct Resolver {
    registry: Arc<Registry>,
    factories: Arc<Factories>,
    hooks: Arc<Hooks>,
    globals: Arc<Globals>,
    auth_map: Arc<OnceLock<Arc<dyn Table>>>,
}

impl Resolver {
    pub fn new(
        registry: Arc<Registry>,
        factories: Arc<Factories>,
        hooks: Arc<Hooks>,
        globals: Arc<Globals>,
    ) -> Self {
        Self {
            registry,
            factories,
            hooks,
            globals,
            auth_map: Arc::new(OnceLock::new()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn hooks(&self) -> &Arc<Hooks> {
        &self.hooks
    }

    pub fn globals(&self) -> &Arc<Globals> {
        &self.globals
    }

    /// Return the instance `name` (or alias), initializing it first if
    /// nobody has yet.
    pub async fn resolve(&self, name: &str) -> Result<Arc<dyn Module>> {
        let info = self
            .registry
            .get(name)
            .ok_or_else(|| MeshError::UnknownReference {
                name: name.to_string(),
            })?;

        if !self.registry.is_initialized(info.instance.instance_name()) {
            self.initialize(&info).await?;
        }
        Ok(info.instance)
    }

    /// Run `init` for a declared instance and record it as initialized.
    pub async fn initialize(&self, info: &ModInfo) -> Result<()> {
        let name = info.instance.instance_name().to_string();
        self.registry.enter(&name)?;

        debug!("{}: init {}", info.block.location, describe(info.instance.as_ref()));
        let ctx = InitContext {
            resolver: self,
            block: &info.block,
        };
        let result = info.instance.init(&ctx).await;
        self.registry.leave(&name);

        result.map_err(|source| MeshError::ModuleInit {
            module: info.instance.name().to_string(),
            instance: name.clone(),
            location: info.block.location.clone(),
            source,
        })?;

        self.registry.mark_initialized(&name)?;
        self.add_close_hook(&info.instance);
        Ok(())
    }

    /// Run `init` for an endpoint and record it as initialized.
    ///
    /// Endpoints are not reachable by name; only the initialized set sees
    /// them.
    pub async fn init_endpoint(&self, info: &ModInfo) -> Result<()> {
        debug!("{}: init endpoint {}", info.block.location, describe(info.instance.as_ref()));
        let ctx = InitContext {
            resolver: self,
            block: &info.block,
        };
        info.instance
            .init(&ctx)
            .await
            .map_err(|source| MeshError::ModuleInit {
                module: info.instance.name().to_string(),
                instance: info.instance.instance_name().to_string(),
                location: info.block.location.clone(),
                source,
            })?;
        self.add_close_hook(&info.instance);
        self.registry.mark_initialized(info.instance.instance_name())
    }

    /// Resolve the global `auth_map` reference, if one is configured.
    ///
    /// The referenced block counts as used like any other dependency.
    pub async fn init_auth_map(&self) -> Result<()> {
        let Some(node) = &self.globals.auth_map else {
            return Ok(());
        };
        let table = self.table_from_node(node).await?;
        if self.auth_map.set(table).is_err() {
            debug!("auth_map already initialized");
        }
        Ok(())
    }

    /// Table named by the global `auth_map` directive, once initialized.
    pub fn auth_map(&self) -> Option<Arc<dyn Table>> {
        self.auth_map.get().cloned()
    }

    /// Resolve `node` and require the storage capability.
    pub async fn storage_from_node(&self, node: &ConfigNode) -> Result<Arc<dyn Storage>> {
        let module = self.module_from_node(node).await?;
        let label = describe(module.as_ref());
        module
            .as_storage()
            .ok_or_else(|| node.error(format!("{}: {} is not a storage", node.name, label)))
    }

    /// Resolve `node` and require the table capability.
    pub async fn table_from_node(&self, node: &ConfigNode) -> Result<Arc<dyn Table>> {
        let module = self.module_from_node(node).await?;
        let label = describe(module.as_ref());
        module
            .as_table()
            .ok_or_else(|| node.error(format!("{}: {} is not a table", node.name, label)))
    }

    /// Instance for a directive that either references a named block
    /// (`storage &local_mailboxes`) or defines one inline
    /// (`storage storage.maildir { path mail }`).
    pub async fn module_from_node(&self, node: &ConfigNode) -> Result<Arc<dyn Module>> {
        let Some(first) = node.args.first() else {
            return Err(node.error(format!("{}: expected module reference", node.name)));
        };

        if let Some(name) = first.strip_prefix('&') {
            if node.args.len() != 1 || node.has_block() {
                return Err(node.error(format!(
                    "{}: a reference to &{} takes no further arguments",
                    node.name, name
                )));
            }
            return self.resolve(name).await.map_err(|e| match e {
                MeshError::UnknownReference { name } => node.error(format!(
                    "{}: unknown module instance referenced: {}",
                    node.name, name
                )),
                other => other,
            });
        }

        let factory = self
            .factories
            .module(first)
            .ok_or_else(|| node.error(format!("{}: unknown module: {}", node.name, first)))?;
        let instance = factory(ModuleSpec {
            module_type: first.clone(),
            instance_name: String::new(),
            aliases: Vec::new(),
            inline_args: Some(node.args[1..].to_vec()),
        })
        .map_err(|source| MeshError::Construct {
            module: first.clone(),
            location: node.location.clone(),
            source,
        })?;

        let ctx = InitContext {
            resolver: self,
            block: node,
        };
        instance
            .init(&ctx)
            .await
            .map_err(|source| MeshError::ModuleInit {
                module: first.clone(),
                instance: String::new(),
                location: node.location.clone(),
                source,
            })?;
        self.add_close_hook(&instance);
        Ok(instance)
    }

    fn add_close_hook(&self, instance: &Arc<dyn Module>) {
        if instance.closer().is_none() {
            return;
        }
        let label = describe(instance.as_ref());
        let instance = Arc::clone(instance);
        self.hooks.add(Event::Shutdown, label.clone(), move || {
            debug!("close {}", label);
            if let Some(closer) = instance.closer() {
                if let Err(e) = closer.close() {
                    error!("module {} close failed: {:#}", label, e);
                }
            }
            Ok(())
        });
    }
}

/// Passed to [`Module::init`]
pub struct InitContext<'a> {
    resolver: &'a Resolver,
    block: &'a ConfigNode,
}

impl<'a> InitContext<'a> {
    pub fn globals(&self) -> &Globals {
        self.resolver.globals()
    }

    /// The block that declared the instance being initialized.
    pub fn block(&self) -> &ConfigNode {
        self.block
    }

    pub async fn resolve(&self, name: &str) -> Result<Arc<dyn Module>> {
        self.resolver.resolve(name).await
    }

    pub async fn module_from_node(&self, node: &ConfigNode) -> Result<Arc<dyn Module>> {
        self.resolver.module_from_node(node).await
    }

    /// Resolve `node` and require the storage capability.
    pub async fn storage(&self, node: &ConfigNode) -> Result<Arc<dyn Storage>> {
        self.resolver.storage_from_node(node).await
    }

    /// Resolve `node` and require the table capability.
    pub async fn table(&self, node: &ConfigNode) -> Result<Arc<dyn Table>> {
        self.resolver.table_from_node(node).await
    }

    pub fn auth_map(&self) -> Option<Arc<dyn Table>> {
        self.resolver.auth_map()
    }
}

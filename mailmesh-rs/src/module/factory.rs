//! Factory tables
//!
//! Endpoint and module constructors live in two separate namespaces; a
//! directive name may appear in at most one of them.

use super::Module;
use crate::error::{MeshError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// What a module factory is asked to build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    pub module_type: String,
    pub instance_name: String,
    pub aliases: Vec<String>,
    /// Arguments following the module type in an inline definition
    pub inline_args: Option<Vec<String>>,
}

pub type ModuleFactory = Arc<dyn Fn(ModuleSpec) -> anyhow::Result<Arc<dyn Module>> + Send + Sync>;

/// Endpoints are built from the raw block arguments
pub type EndpointFactory =
    Arc<dyn Fn(&str, &[String]) -> anyhow::Result<Arc<dyn Module>> + Send + Sync>;

#[derive(Default, Clone)]
pub struct Factories {
    modules: HashMap<String, ModuleFactory>,
    endpoints: HashMap<String, EndpointFactory>,
}

impl Factories {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_free(&self, name: &str) -> Result<()> {
        if self.modules.contains_key(name) || self.endpoints.contains_key(name) {
            return Err(MeshError::FactoryConflict {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn register_module<F>(&mut self, name: &str, factory: F) -> Result<()>
    where
        F: Fn(ModuleSpec) -> anyhow::Result<Arc<dyn Module>> + Send + Sync + 'static,
    {
        self.check_free(name)?;
        self.modules.insert(name.to_string(), Arc::new(factory));
        Ok(())
    }

    pub fn register_endpoint<F>(&mut self, name: &str, factory: F) -> Result<()>
    where
        F: Fn(&str, &[String]) -> anyhow::Result<Arc<dyn Module>> + Send + Sync + 'static,
    {
        self.check_free(name)?;
        self.endpoints.insert(name.to_string(), Arc::new(factory));
        Ok(())
    }

    pub fn module(&self, name: &str) -> Option<ModuleFactory> {
        self.modules.get(name).cloned()
    }

    pub fn endpoint(&self, name: &str) -> Option<EndpointFactory> {
        self.endpoints.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::InitContext;
    use async_trait::async_trait;

    struct Nothing;

    #[async_trait]
    impl Module for Nothing {
        fn name(&self) -> &str {
            "nothing"
        }
        fn instance_name(&self) -> &str {
            "nothing"
        }
        async fn init(&self, _ctx: &InitContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_name_in_one_namespace_only() {
        let mut factories = Factories::new();
        factories
            .register_endpoint("smtp", |_, _| Ok(Arc::new(Nothing) as Arc<dyn Module>))
            .unwrap();
        let err = factories
            .register_module("smtp", |_| Ok(Arc::new(Nothing) as Arc<dyn Module>))
            .unwrap_err();
        assert!(matches!(err, MeshError::FactoryConflict { .. }));
        assert!(factories.endpoint("smtp").is_some());
        assert!(factories.module("smtp").is_none());
    }
}

//! Module contract
//!
//! Every configuration block is backed by an object implementing [`Module`].
//! Blocks whose directive name is an endpoint factory accept network
//! connections and are initialized eagerly; everything else is initialized
//! lazily when first referenced.
//!
//! - [`registry`]: instance/alias table and initialization bookkeeping
//! - [`resolve`]: lazy, memoized resolve-or-initialize
//! - [`factory`]: endpoint and module constructor tables

pub mod factory;
pub mod registry;
pub mod resolve;

pub use factory::{EndpointFactory, Factories, ModuleFactory, ModuleSpec};
pub use registry::{ModInfo, Registry};
pub use resolve::{InitContext, Resolver};

use async_trait::async_trait;
use std::sync::Arc;

/// A configured component
#[async_trait]
pub trait Module: Send + Sync {
    /// Module type, i.e. the directive name that created it.
    fn name(&self) -> &str;

    /// Instance name; empty for anonymous inline definitions.
    fn instance_name(&self) -> &str;

    /// Read the configuration block and acquire resources.
    ///
    /// Called at most once per instance. References to other instances
    /// are resolved through `ctx`, which initializes them on demand.
    async fn init(&self, ctx: &InitContext<'_>) -> anyhow::Result<()>;

    /// Resource release capability, invoked from a shutdown hook.
    fn closer(&self) -> Option<&dyn Closer> {
        None
    }

    fn as_storage(self: Arc<Self>) -> Option<Arc<dyn Storage>> {
        None
    }

    fn as_table(self: Arc<Self>) -> Option<Arc<dyn Table>> {
        None
    }
}

/// Releases resources held by an instance
pub trait Closer {
    fn close(&self) -> anyhow::Result<()>;
}

/// Message store a delivery can be handed to
#[async_trait]
pub trait Storage: Send + Sync {
    /// Store `data` for `recipient`, returning the message identifier.
    async fn deliver(&self, recipient: &str, data: &[u8]) -> anyhow::Result<String>;
}

/// Key/value lookup
pub trait Table: Send + Sync {
    fn lookup(&self, key: &str) -> Option<String>;
}

/// Label used in logs: `type (instance)`.
pub fn describe(module: &dyn Module) -> String {
    if module.instance_name().is_empty() {
        module.name().to_string()
    } else {
        format!("{} ({})", module.name(), module.instance_name())
    }
}

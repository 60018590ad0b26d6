//! Lookup tables
//!
//! ```text
//! table.static aliases {
//!     entry postmaster@example.org admin@example.org
//! }
//! ```

use crate::config::DirectiveMap;
use crate::module::{InitContext, Module, ModuleSpec, Table};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// `table.static`: fixed key/value pairs from `entry` directives
pub struct StaticTable {
    instance_name: String,
    entries: OnceLock<HashMap<String, String>>,
}

impl StaticTable {
    pub fn new(spec: ModuleSpec) -> Result<Self> {
        if spec.inline_args.as_ref().is_some_and(|args| !args.is_empty()) {
            bail!("table.static: inline arguments are not supported");
        }
        Ok(Self {
            instance_name: spec.instance_name,
            entries: OnceLock::new(),
        })
    }
}

#[async_trait]
impl Module for StaticTable {
    fn name(&self) -> &str {
        "table.static"
    }

    fn instance_name(&self) -> &str {
        &self.instance_name
    }

    async fn init(&self, ctx: &InitContext<'_>) -> Result<()> {
        let mut entries = HashMap::new();
        {
            let mut m = DirectiveMap::new(ctx.block());
            m.repeated("entry", |node| {
                node.expect_no_block()?;
                node.expect_args(2)?;
                if entries
                    .insert(node.args[0].clone(), node.args[1].clone())
                    .is_some()
                {
                    return Err(node.error(format!("entry: duplicate key {}", node.args[0])));
                }
                Ok(())
            });
            m.process()?;
        }

        debug!("table.static: {} entries", entries.len());
        self.entries
            .set(entries)
            .map_err(|_| anyhow!("table.static initialized twice"))?;
        Ok(())
    }

    fn as_table(self: Arc<Self>) -> Option<Arc<dyn Table>> {
        Some(self)
    }
}

impl Table for StaticTable {
    fn lookup(&self, key: &str) -> Option<String> {
        self.entries.get()?.get(key).cloned()
    }
}

//! Instance registry
//!
//! Maps instance names and aliases to live instances and records which
//! instances finished `init`. The registry is written only while the server
//! starts; [`Registry::seal`] is called before traffic is accepted, after
//! which every write fails with [`MeshError::RegistrySealed`].

use super::Module;
use crate::config::{ConfigNode, Location};
use crate::error::{MeshError, Result};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// An instance together with the block it was declared by
#[derive(Clone)]
pub struct ModInfo {
    pub instance: Arc<dyn Module>,
    pub block: ConfigNode,
}

impl ModInfo {
    pub fn new(instance: Arc<dyn Module>, block: ConfigNode) -> Self {
        Self { instance, block }
    }
}

#[derive(Default)]
struct State {
    instances: HashMap<String, ModInfo>,
    aliases: HashMap<String, String>,
    initialized: HashSet<String>,
    /// Instances whose `init` is currently on the stack
    visiting: Vec<String>,
}

#[derive(Default)]
pub struct Registry {
    state: RwLock<State>,
    sealed: AtomicBool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self, name: &str) -> Result<RwLockWriteGuard<'_, State>> {
        if self.is_sealed() {
            return Err(MeshError::RegistrySealed {
                name: name.to_string(),
            });
        }
        Ok(self.state.write().unwrap_or_else(|e| e.into_inner()))
    }

    /// Whether `name` is taken by an instance or an alias.
    pub fn has_instance(&self, name: &str) -> bool {
        let state = self.read();
        state.instances.contains_key(name) || state.aliases.contains_key(name)
    }

    /// Declaration site of the instance `name` resolves to.
    pub fn location_of(&self, name: &str) -> Option<Location> {
        self.get(name).map(|info| info.block.location)
    }

    pub fn register_instance(&self, info: ModInfo) -> Result<()> {
        let name = info.instance.instance_name().to_string();
        let previous = self.location_of(&name);
        let mut state = self.write(&name)?;
        if state.instances.contains_key(&name) || state.aliases.contains_key(&name) {
            return Err(MeshError::DuplicateName {
                name,
                location: info.block.location.clone(),
                previous,
            });
        }
        debug!(
            "{}: register config block {}",
            info.block.location, name
        );
        state.instances.insert(name, info);
        Ok(())
    }

    /// Make `alias` resolve to the instance `target`.
    pub fn register_alias(&self, alias: &str, target: &str, location: &Location) -> Result<()> {
        let previous = self.location_of(alias);
        let mut state = self.write(alias)?;
        if state.instances.contains_key(alias) || state.aliases.contains_key(alias) {
            return Err(MeshError::DuplicateName {
                name: alias.to_string(),
                location: location.clone(),
                previous,
            });
        }
        state.aliases.insert(alias.to_string(), target.to_string());
        Ok(())
    }

    /// Look up an instance by name or alias.
    pub fn get(&self, name: &str) -> Option<ModInfo> {
        let state = self.read();
        let key = state.aliases.get(name).map(String::as_str).unwrap_or(name);
        state.instances.get(key).cloned()
    }

    pub fn is_initialized(&self, name: &str) -> bool {
        self.read().initialized.contains(name)
    }

    pub fn mark_initialized(&self, name: &str) -> Result<()> {
        let mut state = self.write(name)?;
        state.initialized.insert(name.to_string());
        Ok(())
    }

    /// Snapshot of initialized instance names.
    pub fn initialized(&self) -> BTreeSet<String> {
        self.read().initialized.iter().cloned().collect()
    }

    /// Record that `init` of `name` is starting.
    ///
    /// Fails with the reference chain if `name` is already being
    /// initialized further up the stack.
    pub(crate) fn enter(&self, name: &str) -> Result<()> {
        let mut state = self.write(name)?;
        if let Some(pos) = state.visiting.iter().position(|n| n == name) {
            let mut chain: Vec<String> = state.visiting[pos..].to_vec();
            chain.push(name.to_string());
            return Err(MeshError::DependencyCycle { chain });
        }
        state.visiting.push(name.to_string());
        Ok(())
    }

    pub(crate) fn leave(&self, name: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = state.visiting.iter().rposition(|n| n == name) {
            state.visiting.remove(pos);
        }
    }

    /// Forbid further writes. Called before endpoints serve traffic.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }
}

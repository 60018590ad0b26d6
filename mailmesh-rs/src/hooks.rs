//! Lifecycle hooks
//!
//! Callbacks are registered against an [`Event`] and run in registration
//! order whenever that event fires. Shutdown hooks therefore close instances
//! in the order they were initialized (first in, first closed); nothing
//! orders them by dependency.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Shutdown,
    LogRotate,
}

type HookFn = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

struct Hook {
    label: String,
    func: HookFn,
}

/// Append-only hook table
#[derive(Default)]
pub struct Hooks {
    table: Mutex<HashMap<Event, Vec<Hook>>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `func` for `event`. `label` identifies the hook in logs.
    pub fn add<F>(&self, event: Event, label: impl Into<String>, func: F)
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let hook = Hook {
            label: label.into(),
            func: Arc::new(func),
        };
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.entry(event).or_default().push(hook);
    }

    /// Number of callbacks registered for `event`.
    pub fn count(&self, event: Event) -> usize {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.get(&event).map(Vec::len).unwrap_or(0)
    }

    /// Run every callback for `event` in registration order.
    ///
    /// A failing callback is logged and does not stop the others. Returns
    /// the number of failures.
    pub fn run(&self, event: Event) -> usize {
        // Snapshot so hooks may register further hooks without deadlocking.
        let hooks: Vec<(String, HookFn)> = {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table
                .get(&event)
                .map(|hooks| {
                    hooks
                        .iter()
                        .map(|h| (h.label.clone(), Arc::clone(&h.func)))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut failures = 0;
        for (label, func) in hooks {
            debug!("running {:?} hook: {}", event, label);
            if let Err(e) = func() {
                error!("{:?} hook {} failed: {:#}", event, label, e);
                failures += 1;
            }
        }
        failures
    }
}

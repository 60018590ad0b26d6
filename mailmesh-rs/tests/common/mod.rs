#![allow(dead_code)]

use async_trait::async_trait;
use mailmesh_rs::config::{parse, ConfigNode, DirectiveMap};
use mailmesh_rs::module::{Closer, Factories, InitContext, Module};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What test doubles observed
#[derive(Default)]
pub struct Counters {
    inits: Mutex<HashMap<String, usize>>,
    closes: Mutex<Vec<String>>,
}

impl Counters {
    pub fn inits(&self, name: &str) -> usize {
        self.inits.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn total_inits(&self) -> usize {
        self.inits.lock().unwrap().values().sum()
    }

    pub fn closes(&self) -> Vec<String> {
        self.closes.lock().unwrap().clone()
    }
}

/// Module double.
///
/// Block directives:
/// - `uses REF`: resolve another instance during init (repeatable)
/// - `fail`: init returns an error
/// - `slow_close`: close sleeps for 500ms
pub struct Probe {
    kind: String,
    instance: String,
    counters: Arc<Counters>,
    slow_close: AtomicBool,
    close_finished: Arc<AtomicBool>,
}

impl Probe {
    fn label(&self) -> String {
        if self.instance.is_empty() {
            self.kind.clone()
        } else {
            self.instance.clone()
        }
    }
}

#[async_trait]
impl Module for Probe {
    fn name(&self) -> &str {
        &self.kind
    }

    fn instance_name(&self) -> &str {
        &self.instance
    }

    async fn init(&self, ctx: &InitContext<'_>) -> anyhow::Result<()> {
        let mut uses: Vec<ConfigNode> = Vec::new();
        let mut fail = false;
        let mut slow_close = false;
        {
            let mut m = DirectiveMap::new(ctx.block());
            m.repeated("uses", |node| {
                uses.push(node.clone());
                Ok(())
            });
            m.bool("fail", &mut fail);
            m.bool("slow_close", &mut slow_close);
            m.process()?;
        }

        *self
            .counters
            .inits
            .lock()
            .unwrap()
            .entry(self.label())
            .or_default() += 1;

        for node in &uses {
            ctx.module_from_node(node).await?;
        }
        if fail {
            anyhow::bail!("{} refused to start", self.label());
        }
        self.slow_close.store(slow_close, Ordering::SeqCst);
        Ok(())
    }

    fn closer(&self) -> Option<&dyn Closer> {
        Some(self)
    }
}

impl Closer for Probe {
    fn close(&self) -> anyhow::Result<()> {
        if self.slow_close.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(500));
        }
        self.counters.closes.lock().unwrap().push(self.label());
        self.close_finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factories with a `listener` endpoint and a `probe` module, both probes.
pub fn probe_factories(counters: &Arc<Counters>, close_finished: &Arc<AtomicBool>) -> Factories {
    let mut factories = Factories::new();

    let c = Arc::clone(counters);
    let f = Arc::clone(close_finished);
    factories
        .register_endpoint("listener", move |name, args| {
            Ok(Arc::new(Probe {
                kind: name.to_string(),
                instance: format!("{}:{}", name, args.join(",")),
                counters: Arc::clone(&c),
                slow_close: AtomicBool::new(false),
                close_finished: Arc::clone(&f),
            }) as Arc<dyn Module>)
        })
        .unwrap();

    let c = Arc::clone(counters);
    let f = Arc::clone(close_finished);
    factories
        .register_module("probe", move |spec| {
            Ok(Arc::new(Probe {
                kind: spec.module_type,
                instance: spec.instance_name,
                counters: Arc::clone(&c),
                slow_close: AtomicBool::new(false),
                close_finished: Arc::clone(&f),
            }) as Arc<dyn Module>)
        })
        .unwrap();

    factories
}

/// Parse `body` after directing the state and runtime directories into
/// `dir`.
pub fn config_in(dir: &Path, body: &str) -> Vec<ConfigNode> {
    let text = format!(
        "state_dir \"{}\"\nruntime_dir \"{}\"\n{}",
        dir.join("state").display(),
        dir.join("run").display(),
        body
    );
    parse(&text, "test.conf").unwrap()
}

pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

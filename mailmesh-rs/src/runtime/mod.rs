//! Server lifecycle
//!
//! [`Server::start`] turns a parsed configuration into live instances:
//!
//! 1. global directives are extracted ([`crate::globals`])
//! 2. state and runtime directories are prepared
//! 3. every remaining block is constructed ([`builder`])
//! 4. endpoints are initialized and unused blocks rejected ([`orchestrator`])
//! 5. the registry is sealed
//!
//! [`Server::serve`] then announces readiness and hands control to the
//! [`signals::SignalCoordinator`] until shutdown.

pub mod builder;
pub mod orchestrator;
pub mod signals;
pub mod status;

pub use builder::{register_modules, ModuleGraph};
pub use orchestrator::init_modules;
pub use signals::{os_signals, ShutdownOutcome, Signal, SignalCoordinator};
pub use status::StatusNotifier;

use crate::config::ConfigNode;
use crate::dirs;
use crate::error::Result;
use crate::globals::read_globals;
use crate::hooks::{Event, Hooks};
use crate::log::LogHandle;
use crate::module::{Factories, Registry, Resolver};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Serving,
    GracefulShutdown,
    Terminated,
    ForcedExit,
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Construct endpoints without initializing them. Modules are then
    /// initialized on demand by the caller and unused blocks are allowed.
    pub no_run: bool,
    /// Change the working directory to the state directory.
    pub chdir: bool,
    pub status: StatusNotifier,
}

pub struct Server {
    resolver: Resolver,
    graph: ModuleGraph,
    status: StatusNotifier,
    state: watch::Sender<LifecycleState>,
}

impl Server {
    pub async fn start(
        nodes: Vec<ConfigNode>,
        factories: Factories,
        log: &LogHandle,
        options: StartOptions,
    ) -> Result<Self> {
        let (state, _) = watch::channel(LifecycleState::Starting);

        let (globals, nodes) = read_globals(nodes, log)?;
        dirs::prepare_directories(&globals.state_dir, &globals.runtime_dir, options.chdir)?;

        let hooks = Arc::new(Hooks::new());
        let rotate_log = log.clone();
        hooks.add(Event::LogRotate, "log output", move || {
            rotate_log.reinit().map_err(anyhow::Error::from)
        });

        let registry = Arc::new(Registry::new());
        let graph = register_modules(&registry, &factories, nodes)?;
        let resolver = Resolver::new(registry, Arc::new(factories), hooks, Arc::new(globals));

        if !options.no_run {
            init_modules(&resolver, &graph).await?;
            resolver.registry().seal();
        }

        Ok(Self {
            resolver,
            graph,
            status: options.status,
            state,
        })
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn graph(&self) -> &ModuleGraph {
        &self.graph
    }

    pub fn hooks(&self) -> &Arc<Hooks> {
        self.resolver.hooks()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Announce readiness and block until shutdown completes or is forced.
    pub async fn serve(self, signals: mpsc::UnboundedReceiver<Signal>) -> ShutdownOutcome {
        self.resolver.registry().seal();
        self.state.send_replace(LifecycleState::Serving);
        self.status.ready("serving");
        info!("server started");

        let coordinator = SignalCoordinator::new(
            Arc::clone(self.resolver.hooks()),
            self.status.clone(),
            self.state.clone(),
        );
        coordinator.run(signals).await
    }

    /// Release everything a no-run tool initialized.
    pub fn finish(self) {
        self.hooks().run(Event::Shutdown);
        self.state.send_replace(LifecycleState::Terminated);
    }
}

//! Signal coordination
//!
//! OS signals are forwarded into a channel by [`os_signals`]; the
//! [`SignalCoordinator`] consumes that channel. The first termination signal
//! starts a graceful shutdown, a second one abandons it.

use super::status::StatusNotifier;
use super::LifecycleState;
use crate::hooks::{Event, Hooks};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Interrupt,
    Hangup,
    /// Reopen log outputs
    Rotate,
}

impl Signal {
    pub fn is_shutdown(self) -> bool {
        !matches!(self, Signal::Rotate)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Terminate => "SIGTERM",
            Signal::Interrupt => "SIGINT",
            Signal::Hangup => "SIGHUP",
            Signal::Rotate => "SIGUSR1",
        };
        f.write_str(name)
    }
}

/// How the process left the serving state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every shutdown hook ran
    Graceful,
    /// A second signal arrived before the hooks finished
    Forced { signal: Signal },
}

impl ShutdownOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownOutcome::Graceful => 0,
            ShutdownOutcome::Forced { .. } => 1,
        }
    }
}

pub struct SignalCoordinator {
    hooks: Arc<Hooks>,
    status: StatusNotifier,
    state: watch::Sender<LifecycleState>,
}

impl SignalCoordinator {
    pub fn new(hooks: Arc<Hooks>, status: StatusNotifier, state: watch::Sender<LifecycleState>) -> Self {
        Self { hooks, status, state }
    }

    fn rotate(&self) {
        info!("rotating log outputs");
        self.hooks.run(Event::LogRotate);
    }

    /// Wait for a termination signal, then run the shutdown hooks.
    ///
    /// A closed channel counts as a termination request.
    pub async fn run(&self, mut signals: mpsc::UnboundedReceiver<Signal>) -> ShutdownOutcome {
        let first = loop {
            match signals.recv().await {
                Some(Signal::Rotate) => self.rotate(),
                Some(signal) => break Some(signal),
                None => break None,
            }
        };

        match first {
            Some(signal) => info!(
                "signal received ({}), next signal will force immediate shutdown",
                signal
            ),
            None => info!("signal source closed, shutting down"),
        }
        self.state.send_replace(LifecycleState::GracefulShutdown);
        self.status.stopping("shutting down");

        let hooks = Arc::clone(&self.hooks);
        let mut shutdown = tokio::task::spawn_blocking(move || hooks.run(Event::Shutdown));
        let mut armed = first.is_some();

        loop {
            tokio::select! {
                joined = &mut shutdown => {
                    match joined {
                        Ok(0) => debug!("shutdown hooks completed"),
                        Ok(failures) => warn!("{} shutdown hook(s) failed", failures),
                        Err(e) => error!("shutdown hooks aborted: {}", e),
                    }
                    self.state.send_replace(LifecycleState::Terminated);
                    info!("server stopped");
                    return ShutdownOutcome::Graceful;
                }
                received = signals.recv(), if armed => {
                    match received {
                        Some(Signal::Rotate) => debug!("ignoring log rotation during shutdown"),
                        Some(signal) => {
                            error!("{} received during shutdown, forcing exit", signal);
                            self.state.send_replace(LifecycleState::ForcedExit);
                            return ShutdownOutcome::Forced { signal };
                        }
                        None => armed = false,
                    }
                }
            }
        }
    }
}

/// Forward OS signals into a channel.
///
/// SIGTERM, SIGINT and SIGHUP request shutdown; SIGUSR1 requests log
/// rotation.
#[cfg(unix)]
pub fn os_signals() -> std::io::Result<mpsc::UnboundedReceiver<Signal>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut hup = signal(SignalKind::hangup())?;
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                Some(()) = term.recv() => Signal::Terminate,
                Some(()) = int.recv() => Signal::Interrupt,
                Some(()) = hup.recv() => Signal::Hangup,
                Some(()) = usr1.recv() => Signal::Rotate,
                else => break,
            };
            if tx.send(received).is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

#[cfg(not(unix))]
pub fn os_signals() -> std::io::Result<mpsc::UnboundedReceiver<Signal>> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(Signal::Interrupt).is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

//! Process logging
//!
//! Events are emitted with `tracing` and formatted by `tracing-subscriber`;
//! the formatted bytes go to the current [`LogOutput`], which lives behind a
//! [`LogHandle`] so it can be swapped at runtime (log file rotation) without
//! reinstalling the subscriber.

pub mod output;

pub use output::{LogOutput, LogTarget};

use crate::error::{MeshError, Result};
use arc_swap::ArcSwap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::filter::{filter_fn, EnvFilter};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

struct Inner {
    output: ArcSwap<LogOutput>,
    debug: AtomicBool,
}

/// Shared handle to the active log output and the debug flag
#[derive(Clone)]
pub struct LogHandle {
    inner: Arc<Inner>,
}

impl LogHandle {
    pub fn new(output: LogOutput) -> Self {
        Self {
            inner: Arc::new(Inner {
                output: ArcSwap::from_pointee(output),
                debug: AtomicBool::new(false),
            }),
        }
    }

    /// Currently active output.
    pub fn output(&self) -> Arc<LogOutput> {
        self.inner.output.load_full()
    }

    /// Install `output`, then close the one it replaces.
    pub fn replace(&self, output: LogOutput) -> Result<()> {
        let previous = self.inner.output.swap(Arc::new(output));
        previous.close()
    }

    /// Rebuild the active output from its stored arguments and swap it in.
    ///
    /// The previous output keeps receiving events until the new one is
    /// fully constructed, and stays active if construction fails.
    pub fn reinit(&self) -> Result<()> {
        let current = self.output();
        let fresh = current.rebuild()?;
        self.replace(fresh)?;
        info!("log output reinitialized: {}", current.args().join(" "));
        Ok(())
    }

    pub fn is_debug(&self) -> bool {
        self.inner.debug.load(Ordering::Relaxed)
    }

    pub fn set_debug(&self, debug: bool) {
        self.inner.debug.store(debug, Ordering::Relaxed);
    }
}

impl Default for LogHandle {
    fn default() -> Self {
        Self::new(LogOutput::stderr())
    }
}

/// Buffers one formatted event and hands it to the output on drop
pub struct LogWriter {
    output: Arc<LogOutput>,
    buf: Vec<u8>,
}

impl io::Write for LogWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.output.write_record(&self.buf);
            self.buf.clear();
        }
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = io::Write::flush(self);
    }
}

impl<'a> MakeWriter<'a> for LogHandle {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            output: self.output(),
            buf: Vec::new(),
        }
    }
}

/// Install the global tracing subscriber writing through `handle`.
///
/// `RUST_LOG` narrows what is recorded; debug-level events additionally
/// require the debug flag on the handle.
pub fn init_tracing(handle: &LogHandle) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let debug_handle = handle.clone();
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(handle.clone())
        .with_ansi(false)
        .without_time()
        .with_target(false)
        .with_filter(filter_fn(move |meta| {
            *meta.level() <= Level::INFO || debug_handle.is_debug()
        }));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| MeshError::Log(format!("failed to install log subscriber: {}", e)))
}

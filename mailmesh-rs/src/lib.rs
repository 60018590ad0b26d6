//! mailmesh-rs: composable mail server runtime
//!
//! The server is assembled from a configuration file. Every top-level block
//! names a module type and an instance; blocks reference each other with
//! `&name`. The runtime builds one instance per block, initializes the
//! endpoints (blocks that accept connections) and everything they
//! transitively reference, and coordinates shutdown on signals.
//!
//! # Example
//!
//! ```no_run
//! use mailmesh_rs::config::parse;
//! use mailmesh_rs::log::LogHandle;
//! use mailmesh_rs::runtime::{os_signals, Server, StartOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let nodes = parse(
//!         "storage.maildir local_mailboxes\n\
//!          smtp tcp://127.0.0.1:2525 {\n    deliver_to &local_mailboxes\n}\n",
//!         "mailmeshd.conf",
//!     )?;
//!
//!     let log = LogHandle::default();
//!     let server = Server::start(
//!         nodes,
//!         mailmesh_rs::builtin::factories()?,
//!         &log,
//!         StartOptions::default(),
//!     )
//!     .await?;
//!     let outcome = server.serve(os_signals()?).await;
//!     std::process::exit(outcome.exit_code());
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: configuration tree, parser and directive matcher
//! - [`globals`]: process-wide directives
//! - [`module`]: module contract, registry and lazy initialization
//! - [`runtime`]: graph construction, startup, signal handling
//! - [`hooks`]: lifecycle events
//! - [`log`]: swappable log output
//! - [`smtp`], [`storage`], [`table`]: built-in modules

pub mod builtin;
pub mod config;
pub mod dirs;
pub mod error;
pub mod globals;
pub mod hooks;
pub mod log;
pub mod module;
pub mod runtime;
pub mod smtp;
pub mod storage;
pub mod table;

// Re-export commonly used types
pub use error::{MeshError, Result};
pub use globals::Globals;
pub use module::{Module, Storage, Table};
pub use runtime::{Server, StartOptions};

//! mailmeshd: composable mail server
//!
//! # Usage
//!
//! ```bash
//! # Start the server
//! mailmeshd run --config /etc/mailmesh/mailmeshd.conf
//!
//! # Write a starter configuration
//! mailmeshd init
//!
//! # Validate the configuration and list its blocks
//! mailmeshd check --json
//!
//! # Deliver a message from stdin through a storage block
//! mailmeshd deliver --cfg-block local_mailboxes user@example.org < message.eml
//! ```

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use mailmesh_rs::config::{parse_file, Location};
use mailmesh_rs::dirs;
use mailmesh_rs::log::{init_tracing, LogHandle, LogOutput};
use mailmesh_rs::module::describe;
use mailmesh_rs::runtime::{os_signals, Server, ShutdownOutcome, StartOptions, StatusNotifier};
use mailmesh_rs::MeshError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "mailmeshd")]
#[command(about = "Composable mail server", long_about = None)]
#[command(disable_version_flag = true)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = "MAILMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Print build information and default paths
    #[arg(long)]
    version: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (default)
    Run {
        /// Log targets used until the configuration sets its own
        /// (stderr, stderr_ts, syslog, off or a file path)
        #[arg(long, num_args = 1..)]
        log: Vec<String>,
    },
    /// Write a default configuration file
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },
    /// Validate the configuration without serving
    Check {
        /// Print the block list as JSON
        #[arg(long)]
        json: bool,
        /// Additionally initialize this block
        #[arg(long)]
        cfg_block: Option<String>,
    },
    /// Deliver a message read from stdin to a storage block
    Deliver {
        /// Storage block to deliver through
        #[arg(long)]
        cfg_block: String,
        /// Recipient address
        recipient: String,
    },
}

#[derive(Serialize)]
struct BlockSummary {
    kind: &'static str,
    module: String,
    instance: String,
    location: Location,
}

const DEFAULT_CONFIG: &str = "\
# mailmeshd configuration

# hostname mx.example.org

storage.maildir local_mailboxes {
    path maildir
}

smtp tcp://127.0.0.1:2525 {
    deliver_to &local_mailboxes
}
";

fn print_version() {
    println!("mailmeshd {}", env!("CARGO_PKG_VERSION"));
    println!("default config: {}", dirs::default_config_path().display());
    println!("default state_dir: {}", dirs::default_state_dir().display());
    println!("default runtime_dir: {}", dirs::default_runtime_dir().display());
}

fn no_run_options() -> StartOptions {
    StartOptions {
        no_run: true,
        chdir: true,
        status: StatusNotifier::disabled(),
    }
}

async fn start_no_run(config: &Path, log: &LogHandle) -> anyhow::Result<Server> {
    let nodes = parse_file(config)?;
    let factories = mailmesh_rs::builtin::factories()?;
    Ok(Server::start(nodes, factories, log, no_run_options()).await?)
}

async fn start(
    config: &Path,
    log: &LogHandle,
    targets: Vec<String>,
    status: StatusNotifier,
) -> anyhow::Result<Server> {
    if !targets.is_empty() {
        log.replace(LogOutput::from_args(&targets)?)?;
    }
    info!("starting mailmeshd {}", env!("CARGO_PKG_VERSION"));

    let nodes = parse_file(config)?;
    let factories = mailmesh_rs::builtin::factories()?;
    let options = StartOptions {
        no_run: false,
        chdir: true,
        status,
    };
    Ok(Server::start(nodes, factories, log, options).await?)
}

async fn run(config: &Path, log: &LogHandle, targets: Vec<String>) -> anyhow::Result<i32> {
    let status = StatusNotifier::from_env();
    let started = start(config, log, targets, status.clone())
        .await
        .and_then(|server| {
            let signals = os_signals().context("failed to install signal handlers")?;
            Ok((server, signals))
        });
    let (server, signals) = match started {
        Ok(started) => started,
        Err(e) => {
            status.status(&format!("startup failed: {:#}", e));
            return Err(e);
        }
    };

    match server.serve(signals).await {
        ShutdownOutcome::Graceful => Ok(0),
        ShutdownOutcome::Forced { signal } => {
            let err = MeshError::ForcedTermination {
                signal: signal.to_string(),
            };
            error!("{}", err);
            // Don't wait for the abandoned shutdown hooks.
            std::process::exit(err.exit_code());
        }
    }
}

fn init(config: &Path, force: bool) -> anyhow::Result<i32> {
    if config.exists() && !force {
        bail!(
            "{} already exists, use --force to overwrite",
            config.display()
        );
    }
    if let Some(parent) = config.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(config, DEFAULT_CONFIG)
        .with_context(|| format!("failed to write {}", config.display()))?;
    println!("Configuration written to {}", config.display());
    Ok(0)
}

async fn check(config: &Path, log: &LogHandle, json: bool, block: Option<String>) -> anyhow::Result<i32> {
    let server = start_no_run(config, log).await?;

    let graph = server.graph();
    let summaries: Vec<BlockSummary> = graph
        .endpoints
        .iter()
        .map(|info| ("endpoint", info))
        .chain(graph.modules.iter().map(|info| ("module", info)))
        .map(|(kind, info)| BlockSummary {
            kind,
            module: info.instance.name().to_string(),
            instance: info.instance.instance_name().to_string(),
            location: info.block.location.clone(),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        for s in &summaries {
            println!("{:<8} {:<16} {:<24} {}", s.kind, s.module, s.instance, s.location);
        }
    }

    let result = match block {
        Some(name) => server
            .resolver()
            .resolve(&name)
            .await
            .map(|instance| println!("{}: initialized", describe(instance.as_ref()))),
        None => Ok(()),
    };
    server.finish();
    result?;
    Ok(0)
}

async fn deliver(config: &Path, log: &LogHandle, block: &str, recipient: &str) -> anyhow::Result<i32> {
    let server = start_no_run(config, log).await?;

    let result = async {
        let instance = server.resolver().resolve(block).await?;
        let label = describe(instance.as_ref());
        let storage = instance
            .as_storage()
            .ok_or_else(|| anyhow!("{} is not a storage", label))?;

        let mut message = Vec::new();
        tokio::io::stdin().read_to_end(&mut message).await?;
        let id = storage.deliver(recipient, &message).await?;
        println!("{}", id);
        anyhow::Ok(())
    }
    .await;

    server.finish();
    result?;
    Ok(0)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if cli.version {
        print_version();
        return;
    }

    let log = LogHandle::default();
    if let Err(e) = init_tracing(&log) {
        eprintln!("{}", e);
    }

    let config = cli.config.unwrap_or_else(dirs::default_config_path);
    let command = cli.command.unwrap_or(Commands::Run { log: Vec::new() });

    let result = match command {
        Commands::Run { log: targets } => run(&config, &log, targets).await,
        Commands::Init { force } => init(&config, force),
        Commands::Check { json, cfg_block } => check(&config, &log, json, cfg_block).await,
        Commands::Deliver {
            cfg_block,
            recipient,
        } => deliver(&config, &log, &cfg_block, &recipient).await,
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            e.downcast_ref::<MeshError>()
                .map(MeshError::exit_code)
                .unwrap_or(1)
        }
    };
    std::process::exit(code);
}

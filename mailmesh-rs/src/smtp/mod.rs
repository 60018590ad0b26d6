//! SMTP receiving endpoint (RFC 5321)
//!
//! - [`session`]: per-connection state machine
//! - [`commands`]: command line parsing
//!
//! ```text
//! smtp tcp://0.0.0.0:25 tcp://[::]:25 {
//!     hostname mx.example.org
//!     deliver_to &local_mailboxes
//!     rcpt_rewrite &aliases
//! }
//! ```

pub mod commands;
pub mod session;

pub use commands::SmtpCommand;
pub use session::{SessionConfig, SmtpSession};

use crate::config::DirectiveMap;
use crate::module::{Closer, InitContext, Module};
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const DEFAULT_MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// `tcp://host:port` into `host:port`
pub fn parse_endpoint_address(addr: &str) -> anyhow::Result<String> {
    let Some((scheme, rest)) = addr.split_once("://") else {
        bail!("malformed endpoint address {}: expected scheme://host:port", addr);
    };
    if scheme != "tcp" {
        bail!("unsupported scheme in {}: {}", addr, scheme);
    }
    if rest.is_empty() || !rest.contains(':') {
        bail!("malformed endpoint address {}: missing port", addr);
    }
    Ok(rest.to_string())
}

pub struct SmtpEndpoint {
    addrs: Vec<String>,
    shutdown: CancellationToken,
    listening: Mutex<Vec<SocketAddr>>,
}

impl SmtpEndpoint {
    pub fn new(addrs: &[String]) -> anyhow::Result<Self> {
        if addrs.is_empty() {
            bail!("smtp: at least one listen address is required");
        }
        let addrs = addrs
            .iter()
            .map(|a| parse_endpoint_address(a))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            addrs,
            shutdown: CancellationToken::new(),
            listening: Mutex::new(Vec::new()),
        })
    }

    /// Addresses actually bound by `init`.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listening
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default()
    }

    async fn accept_loop(listener: TcpListener, config: Arc<SessionConfig>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("listener closed");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        debug!("New SMTP connection from {}", peer);
                        let session = SmtpSession::new(Arc::clone(&config));
                        tokio::spawn(async move {
                            if let Err(e) = session.handle(socket).await {
                                error!("Session error: {:#}", e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
            }
        }
    }
}

#[async_trait]
impl Module for SmtpEndpoint {
    fn name(&self) -> &str {
        "smtp"
    }

    fn instance_name(&self) -> &str {
        "smtp"
    }

    async fn init(&self, ctx: &InitContext<'_>) -> anyhow::Result<()> {
        let mut hostname = None;
        let mut deliver_to = None;
        let mut rcpt_rewrite = None;
        let mut max_message_size = None;
        {
            let mut m = DirectiveMap::new(ctx.block());
            m.string("hostname", false, &mut hostname);
            m.node("deliver_to", true, &mut deliver_to);
            m.node("rcpt_rewrite", false, &mut rcpt_rewrite);
            m.custom(
                "max_message_size",
                false,
                |node| {
                    node.expect_args(1)?;
                    node.args[0]
                        .parse::<usize>()
                        .map_err(|e| node.error(format!("max_message_size: {}", e)))
                },
                &mut max_message_size,
            );
            m.process()?;
        }

        let hostname = hostname
            .or_else(|| ctx.globals().hostname.clone())
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().to_string());
        let deliver_to = deliver_to.ok_or_else(|| anyhow!("deliver_to is required"))?;
        let storage = ctx.storage(&deliver_to).await?;
        let rcpt_rewrite = match rcpt_rewrite {
            Some(node) => Some(ctx.table(&node).await?),
            None => None,
        };

        let config = Arc::new(SessionConfig {
            hostname,
            storage,
            rcpt_rewrite,
            max_message_size: max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
        });

        for addr in &self.addrs {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {}", addr))?;
            let local = listener.local_addr()?;
            info!("smtp: listening on {}", local);
            if let Ok(mut listening) = self.listening.lock() {
                listening.push(local);
            }
            tokio::spawn(Self::accept_loop(
                listener,
                Arc::clone(&config),
                self.shutdown.clone(),
            ));
        }
        Ok(())
    }

    fn closer(&self) -> Option<&dyn Closer> {
        Some(self)
    }
}

impl Closer for SmtpEndpoint {
    fn close(&self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        info!("smtp: stopped listening on {:?}", self.local_addrs());
        Ok(())
    }
}

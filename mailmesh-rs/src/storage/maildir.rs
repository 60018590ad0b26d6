use crate::config::DirectiveMap;
use crate::module::{Closer, InitContext, Module, ModuleSpec, Storage};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::fs;
use tracing::{debug, info};

/// `storage.maildir`: one maildir per recipient under `path`
pub struct MaildirStorage {
    instance_name: String,
    inline_path: Option<String>,
    base_path: OnceLock<PathBuf>,
    closed: AtomicBool,
    delivered: AtomicU64,
}

impl MaildirStorage {
    pub fn new(spec: ModuleSpec) -> Result<Self> {
        let inline_path = match spec.inline_args.as_deref() {
            None | Some([]) => None,
            Some([path]) => Some(path.clone()),
            Some(_) => bail!("storage.maildir: expected at most 1 inline argument"),
        };
        Ok(Self {
            instance_name: spec.instance_name,
            inline_path,
            base_path: OnceLock::new(),
            closed: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
        })
    }

    pub fn base_path(&self) -> Option<&Path> {
        self.base_path.get().map(PathBuf::as_path)
    }

    /// Messages stored since `init`.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub async fn store(&self, recipient: &str, data: &[u8]) -> Result<String> {
        if self.closed.load(Ordering::Acquire) {
            bail!("storage is closed");
        }
        let base = self
            .base_path
            .get()
            .ok_or_else(|| anyhow!("storage used before initialization"))?;
        let mailbox = mailbox_name(recipient)?;

        let mailbox_path = base.join(mailbox);
        ensure_maildir_structure(&mailbox_path).await?;

        let filename = generate_filename();
        let tmp_path = mailbox_path.join("tmp").join(&filename);
        let new_path = mailbox_path.join("new").join(&filename);

        fs::write(&tmp_path, data)
            .await
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &new_path).await?;

        self.delivered.fetch_add(1, Ordering::Relaxed);
        debug!("Stored email for {} as {}", recipient, new_path.display());
        Ok(filename)
    }
}

/// Mailbox directory for a recipient; rejects anything that could escape
/// the storage root.
fn mailbox_name(recipient: &str) -> Result<String> {
    let name = recipient.trim().to_lowercase();
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
    {
        bail!("invalid recipient for maildir delivery: {:?}", recipient);
    }
    Ok(name)
}

async fn ensure_maildir_structure(mailbox_path: &Path) -> Result<()> {
    for subdir in ["tmp", "new", "cur"] {
        let dir = mailbox_path.join(subdir);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }
    Ok(())
}

/// `timestamp.pid_unique.hostname`
fn generate_filename() -> String {
    let timestamp = chrono::Utc::now().timestamp();
    let pid = std::process::id();
    let unique = uuid::Uuid::new_v4().simple();
    let hostname = gethostname::gethostname()
        .to_string_lossy()
        .replace(['/', ':'], "_");

    format!("{}.{}_{}.{}", timestamp, pid, unique, hostname)
}

#[async_trait]
impl Module for MaildirStorage {
    fn name(&self) -> &str {
        "storage.maildir"
    }

    fn instance_name(&self) -> &str {
        &self.instance_name
    }

    async fn init(&self, ctx: &InitContext<'_>) -> Result<()> {
        let mut path = self.inline_path.clone();
        {
            let mut m = DirectiveMap::new(ctx.block());
            m.string("path", false, &mut path);
            m.process()?;
        }

        let path = PathBuf::from(path.unwrap_or_else(|| "maildir".to_string()));
        let path = if path.is_absolute() {
            path
        } else {
            ctx.globals().state_dir.join(path)
        };

        fs::create_dir_all(&path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))?;
        info!("storage.maildir: messages stored under {}", path.display());

        self.base_path
            .set(path)
            .map_err(|_| anyhow!("storage.maildir initialized twice"))?;
        Ok(())
    }

    fn closer(&self) -> Option<&dyn Closer> {
        Some(self)
    }

    fn as_storage(self: Arc<Self>) -> Option<Arc<dyn Storage>> {
        Some(self)
    }
}

#[async_trait]
impl Storage for MaildirStorage {
    async fn deliver(&self, recipient: &str, data: &[u8]) -> Result<String> {
        self.store(recipient, data).await
    }
}

impl Closer for MaildirStorage {
    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(
                "storage.maildir ({}): closed after {} deliveries",
                self.instance_name,
                self.delivered()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailbox_name() {
        assert_eq!(mailbox_name("User@Example.org").unwrap(), "user@example.org");
        assert!(mailbox_name("../etc").is_err());
        assert!(mailbox_name("a/b@example.org").is_err());
        assert!(mailbox_name("").is_err());
    }

    #[test]
    fn test_filenames_unique() {
        assert_ne!(generate_filename(), generate_filename());
    }

    #[test]
    fn test_too_many_inline_args() {
        let spec = ModuleSpec {
            module_type: "storage.maildir".to_string(),
            instance_name: String::new(),
            aliases: Vec::new(),
            inline_args: Some(vec!["a".to_string(), "b".to_string()]),
        };
        assert!(MaildirStorage::new(spec).is_err());
    }

    #[tokio::test]
    async fn test_store_before_init_fails() {
        let spec = ModuleSpec {
            module_type: "storage.maildir".to_string(),
            instance_name: "mail".to_string(),
            aliases: Vec::new(),
            inline_args: None,
        };
        let storage = MaildirStorage::new(spec).unwrap();
        assert!(storage.store("a@example.org", b"x").await.is_err());
    }
}

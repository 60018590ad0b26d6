//! Default locations and directory preparation

use crate::error::{MeshError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CONFIG_FILE_NAME: &str = "mailmeshd.conf";

/// `$MAILMESH_HOME`, or `~/.mailmeshd`.
pub fn default_home() -> PathBuf {
    if let Some(home) = std::env::var_os("MAILMESH_HOME") {
        return PathBuf::from(home);
    }
    let base = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/var/lib"));
    base.join(".mailmeshd")
}

pub fn default_config_path() -> PathBuf {
    default_home().join(CONFIG_FILE_NAME)
}

pub fn default_state_dir() -> PathBuf {
    default_home().join("state")
}

pub fn default_runtime_dir() -> PathBuf {
    default_home().join("run")
}

/// Create `dir` with owner-only permissions and check that it is writable.
pub fn ensure_writable(dir: &Path) -> Result<()> {
    if !dir.is_absolute() {
        return Err(MeshError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("directory path must be absolute: {}", dir.display()),
        )));
    }

    create_private_dir(dir)?;

    let probe = dir.join("writeable-test");
    fs::write(&probe, b"")
        .and_then(|_| fs::remove_file(&probe))
        .map_err(|e| {
            MeshError::Io(std::io::Error::new(
                e.kind(),
                format!("directory {} is not writable: {}", dir.display(), e),
            ))
        })?;
    Ok(())
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

/// Prepare the state and runtime directories.
///
/// With `chdir` set the working directory becomes `state_dir`, so relative
/// paths in module blocks resolve against it.
pub fn prepare_directories(state_dir: &Path, runtime_dir: &Path, chdir: bool) -> Result<()> {
    ensure_writable(state_dir)?;
    ensure_writable(runtime_dir)?;

    if chdir {
        std::env::set_current_dir(state_dir)?;
        debug!("working directory set to {}", state_dir.display());
    }
    Ok(())
}

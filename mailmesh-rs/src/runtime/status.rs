//! Service manager notifications
//!
//! Speaks the `sd_notify` datagram protocol when `NOTIFY_SOCKET` is set and
//! does nothing otherwise.

use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct StatusNotifier {
    socket: Option<PathBuf>,
}

impl StatusNotifier {
    pub fn from_env() -> Self {
        Self {
            socket: std::env::var_os("NOTIFY_SOCKET").map(PathBuf::from),
        }
    }

    /// Notifier that never sends anything.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_socket(path: impl Into<PathBuf>) -> Self {
        Self {
            socket: Some(path.into()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.socket.is_some()
    }

    pub fn ready(&self, status: &str) {
        self.notify(&format!("READY=1\nSTATUS={}", status));
    }

    pub fn stopping(&self, status: &str) {
        self.notify(&format!("STOPPING=1\nSTATUS={}", status));
    }

    pub fn status(&self, status: &str) {
        self.notify(&format!("STATUS={}", status));
    }

    fn notify(&self, state: &str) {
        let Some(socket) = &self.socket else {
            return;
        };
        debug!("service status: {}", state.replace('\n', " "));
        if let Err(e) = send(socket, state) {
            warn!("failed to notify service manager: {}", e);
        }
    }
}

#[cfg(unix)]
fn send(socket: &std::path::Path, state: &str) -> std::io::Result<()> {
    use std::os::unix::net::UnixDatagram;

    let sock = UnixDatagram::unbound()?;
    let name = socket.to_string_lossy();
    if let Some(abstract_name) = name.strip_prefix('@') {
        return send_abstract(&sock, abstract_name, state);
    }
    sock.send_to(state.as_bytes(), socket)?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn send_abstract(
    sock: &std::os::unix::net::UnixDatagram,
    name: &str,
    state: &str,
) -> std::io::Result<()> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    sock.send_to_addr(state.as_bytes(), &addr)?;
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn send_abstract(
    _sock: &std::os::unix::net::UnixDatagram,
    _name: &str,
    _state: &str,
) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "abstract notify sockets are only supported on linux",
    ))
}

#[cfg(not(unix))]
fn send(_socket: &std::path::Path, _state: &str) -> std::io::Result<()> {
    Ok(())
}

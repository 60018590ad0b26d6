//! Log output targets
//!
//! An output is built from the arguments of the `log` directive (or the
//! `--log` flag) and remembers them, so the whole set can be rebuilt later
//! for log file rotation.

use crate::error::{MeshError, Result};
use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// One destination named in a log directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    /// stderr with a timestamp prefix
    StderrTs,
    Syslog,
    /// Discard everything; only valid as the sole target
    Off,
    File(PathBuf),
}

impl LogTarget {
    /// Parse directive arguments. Relative file paths are made absolute so
    /// the output can be recreated after the working directory changes.
    pub fn parse_all(args: &[String]) -> Result<Vec<LogTarget>> {
        if args.is_empty() {
            return Err(MeshError::Log("expected at least 1 log target".to_string()));
        }

        let mut targets = Vec::with_capacity(args.len());
        for arg in args {
            let target = match arg.as_str() {
                "stderr" => LogTarget::Stderr,
                "stderr_ts" => LogTarget::StderrTs,
                "syslog" => LogTarget::Syslog,
                "off" => {
                    if args.len() != 1 {
                        return Err(MeshError::Log(
                            "'off' can't be combined with other log targets".to_string(),
                        ));
                    }
                    LogTarget::Off
                }
                path => {
                    let path = PathBuf::from(path);
                    let path = if path.is_absolute() {
                        path
                    } else {
                        std::env::current_dir()?.join(path)
                    };
                    LogTarget::File(path)
                }
            };
            targets.push(target);
        }
        Ok(targets)
    }

    /// Argument form, as it would be written in the configuration.
    pub fn as_arg(&self) -> String {
        match self {
            LogTarget::Stderr => "stderr".to_string(),
            LogTarget::StderrTs => "stderr_ts".to_string(),
            LogTarget::Syslog => "syslog".to_string(),
            LogTarget::Off => "off".to_string(),
            LogTarget::File(path) => path.display().to_string(),
        }
    }
}

enum Sink {
    Stderr { timestamps: bool },
    Syslog(syslog::SyslogWriter),
    File { path: PathBuf, file: Mutex<File> },
}

impl Sink {
    fn open(target: &LogTarget) -> Result<Option<Sink>> {
        let sink = match target {
            LogTarget::Stderr => Sink::Stderr { timestamps: false },
            LogTarget::StderrTs => Sink::Stderr { timestamps: true },
            LogTarget::Syslog => Sink::Syslog(syslog::SyslogWriter::connect().map_err(|e| {
                MeshError::Log(format!("failed to connect to syslog daemon: {}", e))
            })?),
            LogTarget::Off => return Ok(None),
            LogTarget::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| MeshError::Log(format!("failed to create log file: {}", e)))?;
                Sink::File {
                    path: path.clone(),
                    file: Mutex::new(file),
                }
            }
        };
        Ok(Some(sink))
    }

    fn write(&self, record: &[u8]) {
        // Nothing sensible can be done about a failing log sink.
        let _ = match self {
            Sink::Stderr { timestamps } => {
                let mut stderr = std::io::stderr().lock();
                if *timestamps {
                    let _ = stderr.write_all(timestamp().as_bytes());
                }
                stderr.write_all(record)
            }
            Sink::Syslog(writer) => writer.send(record),
            Sink::File { file, .. } => match file.lock() {
                Ok(mut file) => {
                    let mut line = timestamp().into_bytes();
                    line.extend_from_slice(record);
                    file.write_all(&line)
                }
                Err(_) => Ok(()),
            },
        };
    }

    fn flush(&self) -> std::io::Result<()> {
        match self {
            Sink::Stderr { .. } => std::io::stderr().flush(),
            Sink::Syslog(_) => Ok(()),
            Sink::File { file, path } => match file.lock() {
                Ok(mut file) => file.flush(),
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("log file {} lock poisoned", path.display()),
                )),
            },
        }
    }
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z ").to_string()
}

/// A built set of log sinks plus the arguments it was built from
pub struct LogOutput {
    targets: Vec<LogTarget>,
    sinks: Vec<Sink>,
}

impl LogOutput {
    /// Build an output from directive arguments.
    pub fn from_args(args: &[String]) -> Result<Self> {
        Self::from_targets(LogTarget::parse_all(args)?)
    }

    /// Open every target; nothing is kept if any of them fails.
    pub fn from_targets(targets: Vec<LogTarget>) -> Result<Self> {
        let mut sinks = Vec::with_capacity(targets.len());
        for target in &targets {
            if let Some(sink) = Sink::open(target)? {
                sinks.push(sink);
            }
        }
        Ok(Self { targets, sinks })
    }

    /// Output used before any configuration is read.
    pub fn stderr() -> Self {
        Self {
            targets: vec![LogTarget::Stderr],
            sinks: vec![Sink::Stderr { timestamps: false }],
        }
    }

    pub fn targets(&self) -> &[LogTarget] {
        &self.targets
    }

    /// Arguments that rebuild an equivalent output.
    pub fn args(&self) -> Vec<String> {
        self.targets.iter().map(LogTarget::as_arg).collect()
    }

    /// Build a fresh output from the stored arguments.
    pub fn rebuild(&self) -> Result<Self> {
        Self::from_targets(self.targets.clone())
    }

    /// Write one formatted record to every sink.
    pub fn write_record(&self, record: &[u8]) {
        for sink in &self.sinks {
            sink.write(record);
        }
    }

    /// Flush pending data. File descriptors are released once the last
    /// writer still holding this output drops it.
    pub fn close(&self) -> Result<()> {
        for sink in &self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}

#[cfg(unix)]
mod syslog {
    use std::os::unix::net::UnixDatagram;

    const SOCKET_PATHS: &[&str] = &["/dev/log", "/var/run/syslog", "/var/run/log"];

    /// RFC 3164 datagrams to the local syslog daemon
    pub struct SyslogWriter {
        socket: UnixDatagram,
        tag: String,
    }

    impl SyslogWriter {
        pub fn connect() -> std::io::Result<Self> {
            let socket = UnixDatagram::unbound()?;
            let mut last_err = None;
            for path in SOCKET_PATHS {
                match socket.connect(path) {
                    Ok(()) => {
                        return Ok(Self {
                            socket,
                            tag: format!("mailmeshd[{}]", std::process::id()),
                        })
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            Err(last_err.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no syslog socket")
            }))
        }

        pub fn send(&self, record: &[u8]) -> std::io::Result<()> {
            // facility mail (2), severity info (6)
            let mut msg = format!("<22>{}: ", self.tag).into_bytes();
            let trimmed = record.strip_suffix(b"\n").unwrap_or(record);
            msg.extend_from_slice(trimmed);
            self.socket.send(&msg).map(|_| ())
        }
    }
}

#[cfg(not(unix))]
mod syslog {
    pub struct SyslogWriter;

    impl SyslogWriter {
        pub fn connect() -> std::io::Result<Self> {
            Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "syslog is not supported on this platform",
            ))
        }

        pub fn send(&self, _record: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
    }
}

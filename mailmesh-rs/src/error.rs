//! Error types for mailmesh
//!
//! Everything that can abort startup is a [`MeshError`]. Leaf modules report
//! their own failures as `anyhow::Error`, which the runtime wraps in
//! [`MeshError::ModuleInit`] together with the block location.

use crate::config::Location;
use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, MeshError>;

#[derive(Error, Debug)]
pub enum MeshError {
    /// Malformed configuration text
    #[error("{location}: {message}")]
    Parse { location: Location, message: String },

    /// A recognized directive with the wrong shape
    #[error("{location}: {message}")]
    Directive { location: Location, message: String },

    /// Two declarations share an instance name or alias
    #[error("{location}: config block named {name} already exists{}", previous_suffix(.previous))]
    DuplicateName {
        name: String,
        location: Location,
        previous: Option<Location>,
    },

    #[error("{location}: unknown module or global directive: {name}")]
    UnknownDirective { name: String, location: Location },

    #[error("at least one endpoint should be configured")]
    NoEndpoint,

    #[error("Unused configuration block at {location} - {instance} ({module})")]
    UnusedBlock {
        instance: String,
        module: String,
        location: Location,
    },

    /// The module's own `init` failed
    #[error("{location}: {module} ({instance}) initialization failed: {source:#}")]
    ModuleInit {
        module: String,
        instance: String,
        location: Location,
        #[source]
        source: anyhow::Error,
    },

    /// The factory refused to construct the instance
    #[error("{location}: failed to create {module}: {source:#}")]
    Construct {
        module: String,
        location: Location,
        #[source]
        source: anyhow::Error,
    },

    #[error("factory name {name} is already registered")]
    FactoryConflict { name: String },

    #[error("dependency cycle detected: {}", .chain.join(" -> "))]
    DependencyCycle { chain: Vec<String> },

    #[error("unknown module instance referenced: {name}")]
    UnknownReference { name: String },

    /// Registry mutation attempted while serving traffic
    #[error("module registry is sealed, cannot register {name}")]
    RegistrySealed { name: String },

    #[error("forced shutdown due to repeated signal ({signal})")]
    ForcedTermination { signal: String },

    #[error("Log output error: {0}")]
    Log(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn previous_suffix(previous: &Option<Location>) -> String {
    match previous {
        Some(loc) => format!(" (first declared at {})", loc),
        None => String::new(),
    }
}

impl MeshError {
    /// Build a directive error pointing at `location`.
    pub fn directive(location: &Location, message: impl Into<String>) -> Self {
        MeshError::Directive {
            location: location.clone(),
            message: message.into(),
        }
    }

    /// Process exit status for this error.
    ///
    /// Every startup failure and the forced path exit with 1.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(line: usize) -> Location {
        Location::new("mailmeshd.conf", line)
    }

    #[test]
    fn test_duplicate_name_cites_both_declarations() {
        let err = MeshError::DuplicateName {
            name: "local_mailboxes".to_string(),
            location: loc(12),
            previous: Some(loc(3)),
        };
        let text = err.to_string();
        assert!(text.starts_with("mailmeshd.conf:12:"));
        assert!(text.contains("first declared at mailmeshd.conf:3"));
    }

    #[test]
    fn test_unused_block_message() {
        let err = MeshError::UnusedBlock {
            instance: "orphan".to_string(),
            module: "table.static".to_string(),
            location: loc(7),
        };
        assert_eq!(
            err.to_string(),
            "Unused configuration block at mailmeshd.conf:7 - orphan (table.static)"
        );
    }

    #[test]
    fn test_cycle_chain_rendering() {
        let err = MeshError::DependencyCycle {
            chain: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
    }
}

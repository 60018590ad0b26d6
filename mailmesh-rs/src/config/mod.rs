//! Configuration tree
//!
//! The server is assembled from an ordered tree of [`ConfigNode`]s:
//!
//! - [`parser`]: turns configuration text into nodes
//! - [`map`]: declarative matcher used to read directives out of a block
//!
//! Nodes are immutable once produced. Modules may keep a clone of their own
//! block around for lazy initialization.

pub mod map;
pub mod parser;

pub use map::DirectiveMap;
pub use parser::{parse, parse_file};

use serde::Serialize;
use std::fmt;

/// Source position of a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Location {
    pub file: String,
    pub line: usize,
}

impl Location {
    pub fn new(file: impl Into<String>, line: usize) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// A single directive, optionally carrying a block of child directives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigNode {
    pub name: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ConfigNode>,
    #[serde(flatten)]
    pub location: Location,
}

impl ConfigNode {
    pub fn new(name: impl Into<String>, args: Vec<String>, location: Location) -> Self {
        Self {
            name: name.into(),
            args,
            children: Vec::new(),
            location,
        }
    }

    pub fn with_children(mut self, children: Vec<ConfigNode>) -> Self {
        self.children = children;
        self
    }

    /// Whether the directive was written with a `{ }` block
    pub fn has_block(&self) -> bool {
        !self.children.is_empty()
    }

    /// Build an error anchored at this node.
    pub fn error(&self, message: impl Into<String>) -> crate::MeshError {
        crate::MeshError::directive(&self.location, message)
    }

    /// Fail unless the node has exactly `n` arguments.
    pub fn expect_args(&self, n: usize) -> crate::Result<()> {
        if self.args.len() != n {
            return Err(self.error(format!(
                "{}: expected {} argument(s), got {}",
                self.name,
                n,
                self.args.len()
            )));
        }
        Ok(())
    }

    /// Fail if a block was attached to a directive that doesn't take one.
    pub fn expect_no_block(&self) -> crate::Result<()> {
        if self.has_block() {
            return Err(self.error(format!("{}: can't declare block here", self.name)));
        }
        Ok(())
    }
}

/// Root node wrapping a top-level sequence, used when a whole file is
/// processed like a block.
pub fn root(children: Vec<ConfigNode>) -> ConfigNode {
    let file = children
        .first()
        .map(|n| n.location.file.clone())
        .unwrap_or_default();
    ConfigNode::new("", Vec::new(), Location::new(file, 0)).with_children(children)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_display() {
        assert_eq!(Location::new("a.conf", 4).to_string(), "a.conf:4");
    }

    #[test]
    fn test_expect_args() {
        let node = ConfigNode::new("hostname", vec![], Location::new("a.conf", 1));
        let err = node.expect_args(1).unwrap_err();
        assert_eq!(
            err.to_string(),
            "a.conf:1: hostname: expected 1 argument(s), got 0"
        );
    }
}

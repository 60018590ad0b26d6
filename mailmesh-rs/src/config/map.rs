//! Declarative directive matcher
//!
//! A [`DirectiveMap`] is set up with the directives a block understands and
//! where each parsed value should be written, then [`DirectiveMap::process`]
//! walks the block once:
//!
//! ```
//! use mailmesh_rs::config::{parse, root, DirectiveMap};
//!
//! let block = root(parse("hostname mx.example.org\ndebug\n", "doc.conf").unwrap());
//! let mut hostname = None;
//! let mut debug = false;
//!
//! let mut m = DirectiveMap::new(&block);
//! m.string("hostname", true, &mut hostname);
//! m.bool("debug", &mut debug);
//! m.process().unwrap();
//!
//! assert_eq!(hostname.as_deref(), Some("mx.example.org"));
//! assert!(debug);
//! ```
//!
//! Destinations keep whatever default they held if the directive is absent.

use super::{ConfigNode, Location};
use crate::error::{MeshError, Result};

type Matcher<'a> = Box<dyn FnMut(&ConfigNode) -> Result<()> + 'a>;

struct Entry<'a> {
    name: String,
    required: bool,
    repeatable: bool,
    seen: Option<Location>,
    matcher: Matcher<'a>,
}

pub struct DirectiveMap<'a> {
    block: &'a ConfigNode,
    entries: Vec<Entry<'a>>,
    allow_unknown: bool,
}

impl<'a> DirectiveMap<'a> {
    pub fn new(block: &'a ConfigNode) -> Self {
        Self {
            block,
            entries: Vec::new(),
            allow_unknown: false,
        }
    }

    fn add(&mut self, name: &str, required: bool, matcher: Matcher<'a>) -> &mut Self {
        self.entries.push(Entry {
            name: name.to_string(),
            required,
            repeatable: false,
            seen: None,
            matcher,
        });
        self
    }

    /// Single string argument.
    pub fn string(&mut self, name: &str, required: bool, dest: &'a mut Option<String>) -> &mut Self {
        self.add(
            name,
            required,
            Box::new(move |node| {
                node.expect_no_block()?;
                node.expect_args(1)?;
                *dest = Some(node.args[0].clone());
                Ok(())
            }),
        )
    }

    /// Boolean flag: bare directive means `true`, otherwise `yes`/`no`,
    /// `true`/`false`, `on`/`off`.
    pub fn bool(&mut self, name: &str, dest: &'a mut bool) -> &mut Self {
        self.add(
            name,
            false,
            Box::new(move |node| {
                node.expect_no_block()?;
                *dest = parse_bool(node)?;
                Ok(())
            }),
        )
    }

    /// Like [`DirectiveMap::bool`] but leaves `None` when absent.
    pub fn opt_bool(&mut self, name: &str, dest: &'a mut Option<bool>) -> &mut Self {
        self.add(
            name,
            false,
            Box::new(move |node| {
                node.expect_no_block()?;
                *dest = Some(parse_bool(node)?);
                Ok(())
            }),
        )
    }

    /// One or more string arguments.
    pub fn string_list(&mut self, name: &str, required: bool, dest: &'a mut Vec<String>) -> &mut Self {
        self.add(
            name,
            required,
            Box::new(move |node| {
                node.expect_no_block()?;
                if node.args.is_empty() {
                    return Err(node.error(format!("{}: expected at least 1 argument", node.name)));
                }
                *dest = node.args.clone();
                Ok(())
            }),
        )
    }

    /// Single argument mapped through a fixed table of accepted values.
    pub fn enumeration<T: Copy + 'a>(
        &mut self,
        name: &str,
        values: &'static [(&'static str, T)],
        dest: &'a mut T,
    ) -> &mut Self {
        self.add(
            name,
            false,
            Box::new(move |node| {
                node.expect_no_block()?;
                node.expect_args(1)?;
                let arg = node.args[0].as_str();
                match values.iter().find(|(key, _)| *key == arg) {
                    Some((_, value)) => {
                        *dest = *value;
                        Ok(())
                    }
                    None => {
                        let allowed: Vec<&str> = values.iter().map(|(k, _)| *k).collect();
                        Err(node.error(format!(
                            "{}: invalid value {}, expected one of: {}",
                            node.name,
                            arg,
                            allowed.join(", ")
                        )))
                    }
                }
            }),
        )
    }

    /// Directive parsed by a caller-supplied function.
    pub fn custom<T: 'a, F>(&mut self, name: &str, required: bool, parse: F, dest: &'a mut Option<T>) -> &mut Self
    where
        F: FnMut(&ConfigNode) -> Result<T> + 'a,
    {
        let mut parse = parse;
        self.add(
            name,
            required,
            Box::new(move |node| {
                *dest = Some(parse(node)?);
                Ok(())
            }),
        )
    }

    /// Keep the whole node, e.g. a module reference resolved later.
    pub fn node(&mut self, name: &str, required: bool, dest: &'a mut Option<ConfigNode>) -> &mut Self {
        self.add(
            name,
            required,
            Box::new(move |node| {
                if node.args.is_empty() && !node.has_block() {
                    return Err(node.error(format!("{}: expected at least 1 argument", node.name)));
                }
                *dest = Some(node.clone());
                Ok(())
            }),
        )
    }

    /// Directive that may appear any number of times; every occurrence is
    /// passed to `handle` in order.
    pub fn repeated<F>(&mut self, name: &str, handle: F) -> &mut Self
    where
        F: FnMut(&ConfigNode) -> Result<()> + 'a,
    {
        let mut handle = handle;
        self.entries.push(Entry {
            name: name.to_string(),
            required: false,
            repeatable: true,
            seen: None,
            matcher: Box::new(move |node| handle(node)),
        });
        self
    }

    /// Return unmatched directives from [`DirectiveMap::process`] instead of
    /// failing on them.
    pub fn allow_unknown(&mut self) -> &mut Self {
        self.allow_unknown = true;
        self
    }

    /// Match every child of the block, in order.
    ///
    /// Returns the unmatched nodes when unknown directives are allowed.
    pub fn process(mut self) -> Result<Vec<ConfigNode>> {
        let mut unknown = Vec::new();

        for node in &self.block.children {
            let entry = self.entries.iter_mut().find(|e| e.name == node.name);

            let Some(entry) = entry else {
                if self.allow_unknown {
                    unknown.push(node.clone());
                    continue;
                }
                return Err(node.error(format!("unknown directive: {}", node.name)));
            };

            if !entry.repeatable {
                if let Some(previous) = &entry.seen {
                    return Err(MeshError::directive(
                        &node.location,
                        format!("duplicate directive {} (first at {})", node.name, previous),
                    ));
                }
            }
            entry.seen = Some(node.location.clone());
            (entry.matcher)(node)?;
        }

        for entry in &self.entries {
            if entry.required && entry.seen.is_none() {
                return Err(MeshError::directive(
                    &self.block.location,
                    format!("missing required directive: {}", entry.name),
                ));
            }
        }

        Ok(unknown)
    }
}

fn parse_bool(node: &ConfigNode) -> Result<bool> {
    match node.args.as_slice() {
        [] => Ok(true),
        [value] => match value.as_str() {
            "yes" | "true" | "on" => Ok(true),
            "no" | "false" | "off" => Ok(false),
            other => Err(node.error(format!(
                "{}: invalid boolean value {}, use yes or no",
                node.name, other
            ))),
        },
        _ => Err(node.error(format!("{}: expected at most 1 argument", node.name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse, root};

    fn block(text: &str) -> ConfigNode {
        root(parse(text, "t.conf").unwrap())
    }

    #[test]
    fn test_defaults_survive_absent_directives() {
        let b = block("other 1\n");
        let mut hostname = Some("default".to_string());
        let mut debug = false;
        let mut m = DirectiveMap::new(&b);
        m.string("hostname", false, &mut hostname);
        m.bool("debug", &mut debug);
        m.allow_unknown();
        let unknown = m.process().unwrap();
        assert_eq!(hostname.as_deref(), Some("default"));
        assert!(!debug);
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].name, "other");
    }

    #[test]
    fn test_unknown_directive_rejected() {
        let b = block("bogus 1\n");
        let m = DirectiveMap::new(&b);
        let err = m.process().unwrap_err();
        assert_eq!(err.to_string(), "t.conf:1: unknown directive: bogus");
    }

    #[test]
    fn test_duplicate_directive_rejected() {
        let b = block("hostname a\nhostname b\n");
        let mut hostname = None;
        let mut m = DirectiveMap::new(&b);
        m.string("hostname", false, &mut hostname);
        let err = m.process().unwrap_err();
        assert!(err.to_string().starts_with("t.conf:2: duplicate directive hostname"));
    }

    #[test]
    fn test_required_directive_missing() {
        let b = block("\n");
        let mut path = None;
        let mut m = DirectiveMap::new(&b);
        m.string("path", true, &mut path);
        let err = m.process().unwrap_err();
        assert!(err.to_string().contains("missing required directive: path"));
    }

    #[test]
    fn test_wrong_argument_count() {
        let b = block("hostname a b\n");
        let mut hostname = None;
        let mut m = DirectiveMap::new(&b);
        m.string("hostname", false, &mut hostname);
        assert!(m.process().is_err());
    }

    #[test]
    fn test_enumeration_and_bool_values() {
        #[derive(Debug, Clone, Copy, PartialEq)]
        enum Mode {
            A,
            B,
        }
        const MODES: &[(&str, Mode)] = &[("a", Mode::A), ("b", Mode::B)];

        let b = block("mode b\nflag no\n");
        let mut mode = Mode::A;
        let mut flag = true;
        let mut m = DirectiveMap::new(&b);
        m.enumeration("mode", MODES, &mut mode);
        m.bool("flag", &mut flag);
        m.process().unwrap();
        assert_eq!(mode, Mode::B);
        assert!(!flag);

        let b = block("mode c\n");
        let mut mode = Mode::A;
        let mut m = DirectiveMap::new(&b);
        m.enumeration("mode", MODES, &mut mode);
        assert!(m.process().unwrap_err().to_string().contains("expected one of: a, b"));
    }

    #[test]
    fn test_repeated_directive() {
        let b = block("entry a 1\nentry b 2\n");
        let mut seen = Vec::new();
        let mut m = DirectiveMap::new(&b);
        m.repeated("entry", |node| {
            seen.push(node.args.clone());
            Ok(())
        });
        m.process().unwrap();
        assert_eq!(seen.len(), 2);
    }
}

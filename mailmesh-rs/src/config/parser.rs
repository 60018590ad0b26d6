//! Configuration text parser
//!
//! Syntax:
//!
//! ```text
//! # comment
//! $(primary_domain) = example.org
//!
//! storage.maildir local_mailboxes {
//!     path "mail store"
//! }
//!
//! smtp tcp://0.0.0.0:25 {
//!     hostname mx.$(primary_domain)
//!     deliver_to &local_mailboxes
//! }
//! ```
//!
//! A directive is a name followed by arguments up to the end of the line,
//! optionally opening a `{ ... }` block. `$(name) = value...` defines a macro
//! at top level; `{env:NAME}` expands to an environment variable.

use super::{ConfigNode, Location};
use crate::error::{MeshError, Result};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Word { text: String, quoted: bool },
    Open,
    Close,
    Newline,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    line: usize,
}

/// Read and parse a configuration file.
pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Vec<ConfigNode>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    parse(&content, &path.display().to_string())
}

/// Parse configuration text; `file` is used for error locations.
pub fn parse(input: &str, file: &str) -> Result<Vec<ConfigNode>> {
    let tokens = tokenize(input, file)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        file: file.to_string(),
        macros: HashMap::new(),
    };
    parser.block(0)
}

fn tokenize(input: &str, file: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();

    for (idx, raw_line) in input.lines().enumerate() {
        let line = idx + 1;
        let mut chars = raw_line.chars().peekable();

        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                chars.next();
                continue;
            }
            if c == '#' {
                break;
            }

            if c == '"' {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some(other) => text.push(other),
                            None => break,
                        },
                        '"' => {
                            closed = true;
                            break;
                        }
                        other => text.push(other),
                    }
                }
                if !closed {
                    return Err(MeshError::Parse {
                        location: Location::new(file, line),
                        message: "unterminated quoted string".to_string(),
                    });
                }
                tokens.push(Token {
                    kind: TokenKind::Word { text, quoted: true },
                    line,
                });
                continue;
            }

            let mut text = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == '"' {
                    break;
                }
                text.push(c);
                chars.next();
            }

            let kind = match text.as_str() {
                "{" => TokenKind::Open,
                "}" => TokenKind::Close,
                _ => TokenKind::Word {
                    text,
                    quoted: false,
                },
            };
            tokens.push(Token { kind, line });
        }

        tokens.push(Token {
            kind: TokenKind::Newline,
            line,
        });
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    file: String,
    macros: HashMap<String, Vec<String>>,
}

impl Parser {
    fn err(&self, line: usize, message: impl Into<String>) -> MeshError {
        MeshError::Parse {
            location: Location::new(self.file.clone(), line),
            message: message.into(),
        }
    }

    fn last_line(&self) -> usize {
        self.tokens.last().map(|t| t.line).unwrap_or(0)
    }

    fn block(&mut self, depth: usize) -> Result<Vec<ConfigNode>> {
        let mut nodes = Vec::new();

        loop {
            let Some(token) = self.tokens.get(self.pos).cloned() else {
                if depth > 0 {
                    return Err(self.err(self.last_line(), "unexpected end of file, missing }"));
                }
                return Ok(nodes);
            };

            match token.kind {
                TokenKind::Newline => {
                    self.pos += 1;
                }
                TokenKind::Close => {
                    if depth == 0 {
                        return Err(self.err(token.line, "unexpected }"));
                    }
                    self.pos += 1;
                    return Ok(nodes);
                }
                TokenKind::Open => {
                    return Err(self.err(token.line, "block without directive name"));
                }
                TokenKind::Word { text, quoted } => {
                    self.pos += 1;
                    if let Some(node) = self.directive(text, quoted, token.line, depth)? {
                        nodes.push(node);
                    }
                }
            }
        }
    }

    fn directive(
        &mut self,
        name: String,
        name_quoted: bool,
        line: usize,
        depth: usize,
    ) -> Result<Option<ConfigNode>> {
        let mut raw_args = Vec::new();
        let mut opens_block = false;

        while let Some(token) = self.tokens.get(self.pos) {
            match &token.kind {
                TokenKind::Word { text, quoted } => {
                    raw_args.push((text.clone(), *quoted));
                    self.pos += 1;
                }
                TokenKind::Open => {
                    opens_block = true;
                    self.pos += 1;
                    break;
                }
                TokenKind::Newline | TokenKind::Close => break,
            }
        }

        if let Some(macro_name) = macro_definition(&name, name_quoted) {
            if raw_args.first().map(|(a, _)| a.as_str()) != Some("=") {
                return Err(self.err(line, format!("expected '=' after $({})", macro_name)));
            }
            if depth != 0 {
                return Err(self.err(line, "macros can only be defined at top level"));
            }
            if opens_block {
                return Err(self.err(line, "macro definition can't have a block"));
            }
            let mut values = Vec::new();
            for (arg, quoted) in &raw_args[1..] {
                values.extend(self.expand(arg, *quoted, line)?);
            }
            self.macros.insert(macro_name.to_string(), values);
            return Ok(None);
        }

        let mut expanded_name = self.expand(&name, name_quoted, line)?;
        if expanded_name.len() != 1 {
            return Err(self.err(line, "directive name must expand to a single word"));
        }
        let name = expanded_name.remove(0);

        let mut args = Vec::with_capacity(raw_args.len());
        for (arg, quoted) in &raw_args {
            args.extend(self.expand(arg, *quoted, line)?);
        }

        let mut node = ConfigNode::new(name, args, Location::new(self.file.clone(), line));
        if opens_block {
            node.children = self.block(depth + 1)?;
        }
        Ok(Some(node))
    }

    /// Substitute `$(macro)` and `{env:NAME}` references in one token.
    ///
    /// A token consisting only of a macro reference expands to all of the
    /// macro's values; embedded references are joined with spaces.
    fn expand(&self, token: &str, quoted: bool, line: usize) -> Result<Vec<String>> {
        if !quoted {
            if let Some(name) = whole_macro_ref(token) {
                return self
                    .macros
                    .get(name)
                    .cloned()
                    .ok_or_else(|| self.err(line, format!("unknown macro: $({})", name)));
            }
        }

        let mut out = String::with_capacity(token.len());
        let mut rest = token;
        loop {
            let macro_at = rest.find("$(");
            let env_at = rest.find("{env:");
            let next = match (macro_at, env_at) {
                (Some(m), Some(e)) => Some(m.min(e)),
                (m, e) => m.or(e),
            };
            let Some(start) = next else {
                out.push_str(rest);
                break;
            };

            out.push_str(&rest[..start]);
            let tail = &rest[start..];
            if let Some(inner) = tail.strip_prefix("$(") {
                let end = inner
                    .find(')')
                    .ok_or_else(|| self.err(line, "unterminated macro reference"))?;
                let name = &inner[..end];
                let values = self
                    .macros
                    .get(name)
                    .ok_or_else(|| self.err(line, format!("unknown macro: $({})", name)))?;
                out.push_str(&values.join(" "));
                rest = &inner[end + 1..];
            } else {
                let inner = &tail["{env:".len()..];
                let end = inner
                    .find('}')
                    .ok_or_else(|| self.err(line, "unterminated environment reference"))?;
                out.push_str(&std::env::var(&inner[..end]).unwrap_or_default());
                rest = &inner[end + 1..];
            }
        }

        Ok(vec![out])
    }
}

fn macro_definition(name: &str, quoted: bool) -> Option<&str> {
    if quoted {
        return None;
    }
    whole_macro_ref(name)
}

fn whole_macro_ref(token: &str) -> Option<&str> {
    let inner = token.strip_prefix("$(")?.strip_suffix(')')?;
    if inner.is_empty() || inner.contains(['(', ')']) {
        return None;
    }
    Some(inner)
}

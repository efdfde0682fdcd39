//! Canonical permission strings.
//!
//! A permission is written the way a policy file grants it:
//! `ClassName "name", "actions"`, where both quoted parts are optional and
//! control characters (C0, DEL and C1) inside them are escaped. An empty name
//! or empty actions mean the same as an absent one.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PermissionSpec {
    pub class_name: String,
    pub name: Option<String>,
    pub actions: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PermissionParseError {
    #[error("permission string is empty")]
    Empty,
    #[error("expected `\"` at byte {0}")]
    ExpectedQuote(usize),
    #[error("unterminated quoted string")]
    Unterminated,
    #[error("invalid escape sequence at byte {0}")]
    InvalidEscape(usize),
    #[error("unexpected trailing input at byte {0}")]
    Trailing(usize),
}

impl PermissionSpec {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            name: None,
            actions: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_actions(mut self, actions: impl Into<String>) -> Self {
        self.actions = Some(actions.into());
        self
    }

    /// Encodes the canonical string.
    ///
    /// Empty parts are omitted; actions without a name are written with an
    /// empty name so that the string stays parseable.
    pub fn encode(&self) -> String {
        let mut out = self.class_name.clone();
        let name = self.name.as_deref().filter(|n| !n.is_empty());
        let actions = self.actions.as_deref().filter(|a| !a.is_empty());
        if name.is_some() || actions.is_some() {
            out.push_str(" \"");
            escape_into(name.unwrap_or(""), &mut out);
            out.push('"');
        }
        if let Some(actions) = actions {
            out.push_str(", \"");
            escape_into(actions, &mut out);
            out.push('"');
        }
        out
    }

    /// Parses a canonical string produced by [`PermissionSpec::encode`].
    pub fn parse(input: &str) -> Result<Self, PermissionParseError> {
        let input = input.trim_end();
        let class_end = input.find(' ').unwrap_or(input.len());
        let class_name = &input[..class_end];
        if class_name.is_empty() {
            return Err(PermissionParseError::Empty);
        }

        let mut spec = PermissionSpec::new(class_name);
        let mut pos = class_end;
        if pos == input.len() {
            return Ok(spec);
        }

        pos += 1;
        let (name, next) = parse_quoted(input, pos)?;
        spec.name = Some(name).filter(|n| !n.is_empty());
        pos = next;

        if let Some(rest) = input[pos..].strip_prefix(", ") {
            let start = input.len() - rest.len();
            let (actions, next) = parse_quoted(input, start)?;
            spec.actions = Some(actions).filter(|a| !a.is_empty());
            pos = next;
        }

        if pos != input.len() {
            return Err(PermissionParseError::Trailing(pos));
        }
        Ok(spec)
    }
}

impl fmt::Display for PermissionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn escape_into(value: &str, out: &mut String) {
    for ch in value.chars() {
        match ch {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if c.is_control() => {
                out.push_str(&format!("\\{:03o}", c as u32));
            }
            c => out.push(c),
        }
    }
}

/// Parses a quoted, escaped string starting at `start` (which must be a `"`).
/// Returns the unescaped value and the byte offset after the closing quote.
fn parse_quoted(input: &str, start: usize) -> Result<(String, usize), PermissionParseError> {
    let bytes = input.as_bytes();
    if bytes.get(start) != Some(&b'"') {
        return Err(PermissionParseError::ExpectedQuote(start));
    }

    let mut out = String::new();
    let mut chars = input[start + 1..].char_indices();
    while let Some((offset, ch)) = chars.next() {
        let at = start + 1 + offset;
        match ch {
            '"' => return Ok((out, at + 1)),
            '\\' => {
                let (_, esc) = chars
                    .next()
                    .ok_or(PermissionParseError::Unterminated)?;
                match esc {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    'b' => out.push('\u{8}'),
                    'f' => out.push('\u{c}'),
                    '"' => out.push('"'),
                    '\\' => out.push('\\'),
                    d @ '0'..='7' => {
                        let mut value = d as u32 - '0' as u32;
                        for _ in 0..2 {
                            match chars.next() {
                                Some((_, d @ '0'..='7')) => value = value * 8 + (d as u32 - '0' as u32),
                                _ => return Err(PermissionParseError::InvalidEscape(at)),
                            }
                        }
                        let decoded =
                            char::from_u32(value).ok_or(PermissionParseError::InvalidEscape(at))?;
                        out.push(decoded);
                    }
                    _ => return Err(PermissionParseError::InvalidEscape(at)),
                }
            }
            c => out.push(c),
        }
    }
    Err(PermissionParseError::Unterminated)
}

/// The canonical strings of one logical permission.
///
/// Set-typed permissions (a permission collection, or a service permission
/// naming several classes) expand to one string per element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PermissionSet(BTreeSet<String>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(permission: impl Into<String>) -> Self {
        let mut set = Self::new();
        set.insert(permission);
        set
    }

    pub fn insert(&mut self, permission: impl Into<String>) -> bool {
        self.0.insert(permission.into())
    }

    pub fn contains(&self, permission: &str) -> bool {
        self.0.contains(permission)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl FromIterator<String> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<&'a str> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self(iter.into_iter().map(str::to_owned).collect())
    }
}

impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, permission) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str("; ")?;
            }
            f.write_str(permission)?;
        }
        Ok(())
    }
}

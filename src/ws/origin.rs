//! Glob patterns for the `Origin` handshake check.
//!
//! | Syntax | Matches |
//! |--------|---------|
//! | `*` | any sequence, including empty |
//! | `?` | any single character |
//! | `[abc]`, `[a-z]` | one character from the class |
//! | `[!abc]` | one character outside the class |
//! | `{a,b}` | any of the alternatives |
//! | `\x` | literal `x` |
//!
//! Patterns match the whole origin, e.g. `http://*.example.com`.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use regex::Regex;

use crate::error::{Error, Result};

// ============================================================================
// OriginPattern
// ============================================================================

/// Compiled origin glob.
#[derive(Clone)]
pub struct OriginPattern {
    source: String,
    regex: Regex,
}

impl OriginPattern {
    /// Compiles `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOrigin`] for unbalanced braces, unterminated
    /// classes or a trailing escape.
    pub fn new(pattern: &str) -> Result<Self> {
        let translated = translate(pattern)?;
        let regex = Regex::new(&translated)
            .map_err(|e| Error::invalid_origin(pattern, e.to_string()))?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Returns `true` if `origin` matches the whole pattern.
    #[inline]
    #[must_use]
    pub fn matches(&self, origin: &str) -> bool {
        self.regex.is_match(origin)
    }

    /// Returns the original glob.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl PartialEq for OriginPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for OriginPattern {}

impl fmt::Debug for OriginPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OriginPattern").field(&self.source).finish()
    }
}

impl fmt::Display for OriginPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// ============================================================================
// Translation
// ============================================================================

fn translate(pattern: &str) -> Result<String> {
    let invalid = |message: &str| Error::invalid_origin(pattern, message);

    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');

    let mut chars = pattern.chars();
    let mut depth = 0usize;

    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '{' => {
                depth += 1;
                out.push_str("(?:");
            }
            '}' if depth > 0 => {
                depth -= 1;
                out.push(')');
            }
            ',' if depth > 0 => out.push('|'),
            '\\' => {
                let escaped = chars.next().ok_or_else(|| invalid("trailing escape"))?;
                push_literal(&mut out, escaped);
            }
            '[' => {
                let mut class = String::from("[");
                let mut closed = false;
                let mut first = true;

                for inner in chars.by_ref() {
                    match inner {
                        ']' if !first => {
                            closed = true;
                            break;
                        }
                        '!' if first => class.push('^'),
                        '-' if !first => class.push('-'),
                        other => {
                            if other.is_ascii_punctuation() {
                                class.push('\\');
                            }
                            class.push(other);
                        }
                    }
                    first = false;
                }

                if !closed {
                    return Err(invalid("unterminated character class"));
                }
                class.push(']');
                out.push_str(&class);
            }
            other => push_literal(&mut out, other),
        }
    }

    if depth != 0 {
        return Err(invalid("unbalanced braces"));
    }

    out.push('$');
    Ok(out)
}

fn push_literal(out: &mut String, c: char) {
    let mut buf = [0u8; 4];
    out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
}

// ============================================================================
// Tests
// ============================================================================

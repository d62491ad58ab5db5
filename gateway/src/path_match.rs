//! Compiled path patterns.
//!
//! Two pattern shapes are supported: an exact path (`/health`) and a
//! segment prefix (`/api/auth/**`). `/**` matches every path. Patterns are
//! parsed once at startup and evaluated without allocation per request.
//!
//! Requests are matched on their canonical path (see [`canonicalize`]), the
//! same string that is forwarded upstream.

use std::cmp::Reverse;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathError {
    #[error("path is not absolute")]
    NotAbsolute,
    #[error("malformed percent-encoding")]
    BadEncoding,
    #[error("path separator inside a segment")]
    EmbeddedSeparator,
    #[error("empty path segment")]
    EmptySegment,
    #[error("dot segment")]
    DotSegment,
    #[error("path parameters are not accepted")]
    PathParameter,
}

/// Canonical form of a request path.
///
/// Percent-encoded unreserved characters are decoded, other escapes are
/// kept with upper-case hex. Paths a backend could resolve differently from
/// the literal string are refused: `.`/`..` segments (encoded or not),
/// empty segments, `;` parameters, backslashes and encoded `/` or `\`.
pub fn canonicalize(raw: &str) -> Result<String, PathError> {
    let rest = raw.strip_prefix('/').ok_or(PathError::NotAbsolute)?;
    if rest.is_empty() {
        return Ok("/".to_string());
    }

    let mut canonical = String::with_capacity(raw.len());
    for segment in rest.split('/') {
        let segment = canonical_segment(segment)?;
        match segment.as_str() {
            "" => return Err(PathError::EmptySegment),
            "." | ".." => return Err(PathError::DotSegment),
            _ => {}
        }
        canonical.push('/');
        canonical.push_str(&segment);
    }
    Ok(canonical)
}

fn canonical_segment(segment: &str) -> Result<String, PathError> {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(segment.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .filter(|h| h.iter().all(u8::is_ascii_hexdigit))
                    .ok_or(PathError::BadEncoding)?;
                let value = std::str::from_utf8(hex)
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or(PathError::BadEncoding)?;
                match value {
                    b'/' | b'\\' => return Err(PathError::EmbeddedSeparator),
                    v if is_unreserved(v) => out.push(v),
                    v => out.extend_from_slice(format!("%{:02X}", v).as_bytes()),
                }
                i += 3;
            }
            b'\\' => return Err(PathError::EmbeddedSeparator),
            b';' => return Err(PathError::PathParameter),
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| PathError::BadEncoding)
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    Exact(String),
    /// Stored without the trailing `/**`; empty means "everything".
    Prefix(String),
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        match pattern.strip_suffix("/**") {
            Some(prefix) => PathPattern::Prefix(prefix.trim_end_matches('/').to_string()),
            None => PathPattern::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(exact) => path == exact,
            PathPattern::Prefix(prefix) if prefix.is_empty() => true,
            PathPattern::Prefix(prefix) => match path.strip_prefix(prefix.as_str()) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            },
        }
    }

    /// Ordering key: exact patterns beat prefixes, longer prefixes beat shorter.
    fn specificity(&self) -> (u8, usize) {
        match self {
            PathPattern::Exact(p) => (1, p.len()),
            PathPattern::Prefix(p) => (0, p.len()),
        }
    }
}

/// Unordered set of patterns answering "does any match?".
#[derive(Debug, Clone, Default)]
pub struct PathMatcher {
    patterns: Vec<PathPattern>,
}

impl PathMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self {
            patterns: patterns
                .iter()
                .map(|p| PathPattern::parse(p.as_ref()))
                .collect(),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(path))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Patterns mapped to values, evaluated most-specific first.
#[derive(Debug, Clone)]
pub struct PathTable<T> {
    entries: Vec<(PathPattern, T)>,
}

impl<T> PathTable<T> {
    pub fn new(entries: impl IntoIterator<Item = (PathPattern, T)>) -> Self {
        let mut entries: Vec<(PathPattern, T)> = entries.into_iter().collect();
        // Stable sort keeps declaration order among equally specific patterns.
        entries.sort_by_key(|(pattern, _)| Reverse(pattern.specificity()));
        Self { entries }
    }

    pub fn lookup(&self, path: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|(pattern, _)| pattern.matches(path))
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

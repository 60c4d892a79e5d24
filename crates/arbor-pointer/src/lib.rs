//! JSON Pointer (RFC 6901) utilities.
//!
//! Tree paths in arbor are absolute pointers rooted at a node (`""` is the
//! node itself, `"/todos/0/title"` a descendant slot). This crate owns the
//! escaping rules and the prefix arithmetic used to rebase a tree-absolute
//! pointer onto a subscribed subtree.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PointerError {
    #[error("json pointer must be empty or start with '/': `{0}`")]
    NotAbsolute(String),
}

/// Unescapes one pointer token (`~1` -> `/`, `~0` -> `~`).
pub fn unescape_segment(segment: &str) -> String {
    if !segment.contains('~') {
        return segment.to_string();
    }
    segment.replace("~1", "/").replace("~0", "~")
}

/// Escapes one pointer token (`~` -> `~0`, `/` -> `~1`).
pub fn escape_segment(segment: &str) -> String {
    if !segment.contains('/') && !segment.contains('~') {
        return segment.to_string();
    }
    segment.replace('~', "~0").replace('/', "~1")
}

/// Parses an absolute pointer into unescaped segments.
///
/// `""` parses to no segments, `"/"` to one empty segment.
pub fn parse_pointer(pointer: &str) -> Result<Vec<String>, PointerError> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    if !pointer.starts_with('/') {
        return Err(PointerError::NotAbsolute(pointer.to_string()));
    }
    Ok(pointer.split('/').skip(1).map(unescape_segment).collect())
}

/// Formats unescaped segments back into an absolute pointer.
pub fn format_pointer<S: AsRef<str>>(segments: &[S]) -> String {
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(&escape_segment(segment.as_ref()));
    }
    out
}

/// Appends one segment to an absolute pointer.
pub fn join_pointer(base: &str, segment: &str) -> String {
    let mut out = String::with_capacity(base.len() + segment.len() + 1);
    out.push_str(base);
    out.push('/');
    out.push_str(&escape_segment(segment));
    out
}

/// Rebase `pointer` relative to `base`.
///
/// Returns `Some("")` when they are equal, `Some("/rest")` when `base` is a
/// strict segment-prefix, and `None` otherwise. Both arguments must be
/// absolute pointers over the same root.
pub fn rebase_pointer(base: &str, pointer: &str) -> Option<String> {
    if base.is_empty() {
        return Some(pointer.to_string());
    }
    let rest = pointer.strip_prefix(base)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest.to_string())
    } else {
        // `/todos` is not a prefix of `/todos2`.
        None
    }
}

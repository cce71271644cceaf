//! Route patterns and request-path normalization.
//!
//! A pattern compiles against its router's mount path into a sequence of
//! segments: literals, named parameters (`:name`, one segment) and an
//! optional tail wildcard (`*name` or `*`, the remainder of the path,
//! possibly empty). The bare pattern `"*"` is reserved for the absolute
//! request form (`OPTIONS *`).
//!
//! Request paths are normalized before matching: percent-encoded octets are
//! decoded, repeated slashes collapse, `.` and `..` segments resolve, and a
//! path that would climb above the root is refused. Patterns go through the
//! same normalization at compile time and are rejected if they escape their
//! mount.

use std::collections::HashMap;

use percent_encoding::percent_decode_str;
use thiserror::Error;

/// Rejection of a pattern at registration time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("pattern must start with '/': {0}")]
    NotAbsolute(String),

    #[error("pattern has an empty segment: {0}")]
    EmptySegment(String),

    #[error("tail wildcard must be the final element: {0}")]
    TailNotLast(String),

    #[error("parameter segment needs a name: {0}")]
    UnnamedParam(String),

    #[error("pattern escapes the mount path {mount}: {pattern}")]
    EscapesMount { mount: String, pattern: String },

    #[error("invalid mount path: {0}")]
    InvalidMount(String),
}

/// A compiled route pattern.
#[derive(Debug)]
pub struct TargetPath {
    source: String,
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    /// The reserved absolute form, matching only `*`.
    Asterisk,
    Segments(Vec<Segment>),
}

#[derive(Debug)]
enum Segment {
    Literal(String),
    Param(String),
    Tail(Option<String>),
}

impl TargetPath {
    /// Compiles `pattern` under `mount` (an already-normalized absolute
    /// path; `/` composes as the empty prefix).
    pub fn compile(mount: &str, pattern: &str) -> Result<Self, PatternError> {
        if pattern == "*" {
            return Ok(Self { source: pattern.to_owned(), kind: Kind::Asterisk });
        }
        if !pattern.starts_with('/') {
            return Err(PatternError::NotAbsolute(pattern.to_owned()));
        }

        let full = join_paths(mount, pattern);

        // resolve dot segments; escaping the root escapes every mount
        let mut resolved: Vec<&str> = Vec::new();
        for segment in full.split('/').skip(1) {
            match segment {
                "" => return Err(PatternError::EmptySegment(pattern.to_owned())),
                "." => {}
                ".." => {
                    if resolved.pop().is_none() {
                        return Err(PatternError::EscapesMount {
                            mount: mount.to_owned(),
                            pattern: pattern.to_owned(),
                        });
                    }
                }
                other => resolved.push(other),
            }
        }

        // the resolved pattern must still live under the mount
        let mount_segments: Vec<&str> = path_segments(mount).collect();
        if resolved.len() < mount_segments.len()
            || !mount_segments.iter().zip(&resolved).all(|(mount_seg, seg)| mount_seg == seg)
        {
            return Err(PatternError::EscapesMount { mount: mount.to_owned(), pattern: pattern.to_owned() });
        }

        let mut segments = Vec::with_capacity(resolved.len());
        for (index, raw) in resolved.iter().enumerate() {
            let segment = if let Some(name) = raw.strip_prefix(':') {
                if name.is_empty() {
                    return Err(PatternError::UnnamedParam(pattern.to_owned()));
                }
                Segment::Param(name.to_owned())
            } else if let Some(name) = raw.strip_prefix('*') {
                if index + 1 != resolved.len() {
                    return Err(PatternError::TailNotLast(pattern.to_owned()));
                }
                Segment::Tail(if name.is_empty() { None } else { Some(name.to_owned()) })
            } else {
                Segment::Literal((*raw).to_owned())
            };
            segments.push(segment);
        }

        Ok(Self { source: pattern.to_owned(), kind: Kind::Segments(segments) })
    }

    /// The pattern as written at registration.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Matches an already-normalized request path, yielding the bound
    /// parameters on success.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let segments = match &self.kind {
            Kind::Asterisk => return (path == "*").then(HashMap::new),
            Kind::Segments(segments) => segments,
        };

        let path_segments: Vec<&str> = path_segments(path).collect();
        let mut params = HashMap::new();

        for (index, segment) in segments.iter().enumerate() {
            match segment {
                Segment::Literal(literal) => {
                    if path_segments.get(index) != Some(&literal.as_str()) {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    let value = path_segments.get(index)?;
                    params.insert(name.clone(), (*value).to_owned());
                }
                Segment::Tail(name) => {
                    // the tail matches the remainder, which may be empty
                    if let Some(name) = name {
                        let rest = if index < path_segments.len() { path_segments[index..].join("/") } else { String::new() };
                        params.insert(name.clone(), rest);
                    }
                    return Some(params);
                }
            }
        }

        (path_segments.len() == segments.len()).then_some(params)
    }
}

/// Normalizes a request path: percent-decode, collapse repeated slashes,
/// resolve `.` and `..`. Returns `None` for paths that are not absolute,
/// decode to invalid UTF-8, or climb above the root.
pub fn normalize_path(raw: &str) -> Option<String> {
    if raw == "*" {
        return Some("*".to_owned());
    }
    if !raw.starts_with('/') {
        return None;
    }

    let decoded = percent_decode_str(raw).decode_utf8().ok()?;

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() { Some("/".to_owned()) } else { Some(format!("/{}", segments.join("/"))) }
}

/// Joins a normalized mount path and an absolute sub-path literally;
/// mount `/` composes as the empty prefix.
pub(crate) fn join_paths(mount: &str, path: &str) -> String {
    if mount == "/" { path.to_owned() } else { format!("{mount}{path}") }
}

/// True when `path` lies inside `mount`.
pub(crate) fn within_mount(mount: &str, path: &str) -> bool {
    if mount == "/" {
        return true;
    }
    path == mount || (path.starts_with(mount) && path.as_bytes().get(mount.len()) == Some(&b'/'))
}

fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(pattern: &TargetPath, path: &str) -> HashMap<String, String> {
        pattern.matches(path).expect("pattern matches")
    }

    #[test]
    fn literal_segments_match_exactly() {
        let pattern = TargetPath::compile("/", "/a/b").unwrap();
        assert!(pattern.matches("/a/b").is_some());
        assert!(pattern.matches("/a").is_none());
        assert!(pattern.matches("/a/b/c").is_none());
        assert!(pattern.matches("/a/x").is_none());
    }

    #[test]
    fn params_bind_one_segment() {
        let pattern = TargetPath::compile("/", "/messages/:id").unwrap();

        let params = bound(&pattern, "/messages/42");
        assert_eq!(params.get("id").map(String::as_str), Some("42"));

        assert!(pattern.matches("/messages").is_none());
        assert!(pattern.matches("/messages/42/edit").is_none());
    }

    #[test]
    fn tail_matches_empty_and_deep_remainders() {
        let pattern = TargetPath::compile("/", "/files/*rest").unwrap();

        assert_eq!(bound(&pattern, "/files").get("rest").map(String::as_str), Some(""));
        assert_eq!(bound(&pattern, "/files/a/b/c").get("rest").map(String::as_str), Some("a/b/c"));

        let unnamed = TargetPath::compile("/", "/files/*").unwrap();
        assert!(unnamed.matches("/files").is_some());
        assert!(unnamed.matches("/files/a/b/c").is_some());
        assert!(unnamed.matches("/other").is_none());
    }

    #[test]
    fn patterns_compile_under_their_mount() {
        let pattern = TargetPath::compile("/api", "/messages/:id").unwrap();
        assert!(pattern.matches("/api/messages/42").is_some());
        assert!(pattern.matches("/messages/42").is_none());
    }

    #[test]
    fn asterisk_is_reserved_for_the_absolute_form() {
        let pattern = TargetPath::compile("/", "*").unwrap();
        assert!(pattern.matches("*").is_some());
        assert!(pattern.matches("/").is_none());
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        assert_eq!(
            TargetPath::compile("/", "/a/*rest/b").unwrap_err(),
            PatternError::TailNotLast("/a/*rest/b".to_owned())
        );
        assert_eq!(TargetPath::compile("/", "/a//b").unwrap_err(), PatternError::EmptySegment("/a//b".to_owned()));
        assert_eq!(TargetPath::compile("/", "/a/:").unwrap_err(), PatternError::UnnamedParam("/a/:".to_owned()));
        assert!(matches!(TargetPath::compile("/", "a/b").unwrap_err(), PatternError::NotAbsolute(_)));
    }

    #[test]
    fn patterns_may_not_escape_their_mount() {
        assert!(matches!(
            TargetPath::compile("/api", "/../admin").unwrap_err(),
            PatternError::EscapesMount { .. }
        ));
        // dot segments that stay inside the mount are fine
        let pattern = TargetPath::compile("/api", "/v1/../messages").unwrap();
        assert!(pattern.matches("/api/messages").is_some());
    }

    #[test]
    fn normalization_decodes_and_resolves() {
        assert_eq!(normalize_path("/a%20b/c").as_deref(), Some("/a b/c"));
        assert_eq!(normalize_path("//a///b").as_deref(), Some("/a/b"));
        assert_eq!(normalize_path("/a/./b/../c").as_deref(), Some("/a/c"));
        assert_eq!(normalize_path("/").as_deref(), Some("/"));
        assert_eq!(normalize_path("*").as_deref(), Some("*"));
    }

    #[test]
    fn normalization_refuses_escapes() {
        assert_eq!(normalize_path("/../etc/passwd"), None);
        assert_eq!(normalize_path("/a/../../etc"), None);
        assert_eq!(normalize_path("no-slash"), None);
    }

    #[test]
    fn mount_containment() {
        assert!(within_mount("/", "/anything"));
        assert!(within_mount("/api", "/api"));
        assert!(within_mount("/api", "/api/messages"));
        assert!(!within_mount("/api", "/apix"));
        assert!(!within_mount("/api", "/"));
    }
}

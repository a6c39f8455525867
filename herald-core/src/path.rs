//! Hierarchical topic paths.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A hierarchical topic identifier such as `/notifications/user/42`.
///
/// The first path segment names the message partition: all messages whose
/// paths share a first segment share one append-only log and one id sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(String);

impl Path {
    /// Create a path from its textual form.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The partition name: the first path segment, without slashes.
    ///
    /// `/foo/bar` and `/foo` both map to partition `foo`; an empty or
    /// bare-slash path maps to the empty partition name.
    pub fn partition(&self) -> &str {
        let trimmed = self.0.strip_prefix('/').unwrap_or(&self.0);
        match trimmed.find('/') {
            Some(idx) => &trimmed[..idx],
            None => trimmed,
        }
    }

    /// Whether a message published at `self` is covered by a route installed
    /// at `route_path`.
    ///
    /// A route matches its own path and every strict subtopic: `/foo` covers
    /// `/foo` and `/foo/bar`, but never `/foobar`.
    pub fn matches_route(&self, route_path: &Path) -> bool {
        let message = self.0.as_str();
        let route = route_path.0.as_str();
        message.starts_with(route)
            && (message.len() == route.len() || message.as_bytes()[route.len()] == b'/')
    }

    /// The path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the path is syntactically usable: non-empty and absolute.
    pub fn is_valid(&self) -> bool {
        self.0.starts_with('/') && self.0.len() > 1
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Path {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for Path {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_is_first_segment() {
        assert_eq!(Path::from("/foo/bar/baz").partition(), "foo");
        assert_eq!(Path::from("/foo").partition(), "foo");
        assert_eq!(Path::from("foo/bar").partition(), "foo");
        assert_eq!(Path::from("/").partition(), "");
        assert_eq!(Path::from("").partition(), "");
    }

    #[test]
    fn route_matches_self_and_subtopics() {
        let route = Path::from("/foo");
        assert!(Path::from("/foo").matches_route(&route));
        assert!(Path::from("/foo/bar").matches_route(&route));
        assert!(Path::from("/foo/bar/baz").matches_route(&route));
    }

    #[test]
    fn route_does_not_match_substring_topics() {
        let route = Path::from("/foo");
        assert!(!Path::from("/foobar").matches_route(&route));
        assert!(!Path::from("/fo").matches_route(&route));
        assert!(!Path::from("/bar/foo").matches_route(&route));
    }

    #[test]
    fn validity() {
        assert!(Path::from("/foo").is_valid());
        assert!(!Path::from("foo").is_valid());
        assert!(!Path::from("/").is_valid());
        assert!(!Path::from("").is_valid());
    }
}

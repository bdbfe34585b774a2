//! Tree paths
//!
//! A [`Path`] addresses a node in the state tree as a sequence of string keys.
//! The root is the empty path and displays as `/`.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Segment that moves one level up when resolving relative wires.
pub const PARENT_SEGMENT: &str = "..";

/// Absolute location of a node in the state tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a `/`-separated path. Empty segments are ignored, so `/a//b`
    /// and `a/b` are the same path.
    pub fn parse(s: &str) -> Self {
        Self::new(s.split('/').filter(|seg| !seg.is_empty()))
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<Path> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn child(&self, key: impl Into<String>) -> Path {
        let mut segments = self.segments.clone();
        segments.push(key.into());
        Self { segments }
    }

    pub fn join(&self, other: &Path) -> Path {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// Resolve relative segments against this path, honouring `..`.
    ///
    /// Returns `None` when `..` would climb above the root.
    pub fn resolve<S: AsRef<str>>(&self, relative: &[S]) -> Option<Path> {
        let mut segments = self.segments.clone();
        for seg in relative {
            match seg.as_ref() {
                PARENT_SEGMENT => {
                    segments.pop()?;
                }
                "" | "." => {}
                other => segments.push(other.to_string()),
            }
        }
        Some(Self { segments })
    }

    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// Whether either path is a prefix of the other.
    ///
    /// Two overlapping paths touch the same data: a write to `cells` affects a
    /// reader of `cells/0/delta` and vice versa.
    pub fn overlaps(&self, other: &Path) -> bool {
        self.starts_with(other) || other.starts_with(self)
    }

    /// The remainder of this path below `prefix`, if it is a prefix.
    pub fn strip_prefix(&self, prefix: &Path) -> Option<&[String]> {
        self.segments.strip_prefix(prefix.segments.as_slice())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "/");
        }
        for seg in &self.segments {
            write!(f, "/{}", seg)?;
        }
        Ok(())
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<Vec<String>> for Path {
    fn from(segments: Vec<String>) -> Self {
        Self { segments }
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Path::parse(&s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let path = Path::parse("cells/0/delta");
        assert_eq!(path.len(), 3);
        assert_eq!(path.to_string(), "/cells/0/delta");
        assert_eq!(Path::root().to_string(), "/");
        assert_eq!(Path::parse("/cells//0"), Path::new(["cells", "0"]));
    }

    #[test]
    fn test_resolve_relative() {
        let scope = Path::parse("environment/0");
        assert_eq!(scope.resolve(&["mass"]), Some(Path::parse("environment/0/mass")));
        assert_eq!(scope.resolve(&[".."]), Some(Path::parse("environment")));
        assert_eq!(scope.resolve(&["..", "..", "time"]), Some(Path::parse("time")));
        assert_eq!(scope.resolve(&["..", "..", ".."]), None);
    }

    #[test]
    fn test_overlaps() {
        let cells = Path::parse("cells");
        let delta = Path::parse("cells/0/delta");
        let table = Path::parse("neighborhood");
        assert!(cells.overlaps(&delta));
        assert!(delta.overlaps(&cells));
        assert!(!cells.overlaps(&table));
        assert!(Path::root().overlaps(&table));
    }

    #[test]
    fn test_strip_prefix() {
        let delta = Path::parse("cells/0/delta");
        let rest = delta.strip_prefix(&Path::parse("cells")).unwrap();
        assert_eq!(rest, ["0".to_string(), "delta".to_string()]);
        assert!(delta.strip_prefix(&Path::parse("other")).is_none());
    }
}

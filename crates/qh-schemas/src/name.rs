//! Hierarchical entity names.
//!
//! An [`EntityName`] is an immutable path value: a sequence of segments plus
//! the cached joined form. Parent/level/prefix questions are answered from the
//! segments without re-splitting strings at every call site.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::QuotaError;

/// Separator between path segments in the joined form.
pub const PATH_SEPARATOR: char = '/';

/// Local name of the tree root. Every entity name starts with this segment.
pub const ROOT_NAME: &str = "system";

/// Immutable hierarchical entity name.
///
/// Ordering compares the segment sequences element-wise (so `system/a/b`
/// sorts before `system/a-x`, whatever the separator's byte value); every
/// lock site orders through this same `Ord`, which is all the canonical lock
/// order needs.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityName {
    segments: Vec<String>,
    joined: String,
}

impl EntityName {
    /// The tree root, `system`.
    pub fn root() -> Self {
        Self {
            segments: vec![ROOT_NAME.to_string()],
            joined: ROOT_NAME.to_string(),
        }
    }

    /// Parse a full name like `system/users/alice`.
    ///
    /// # Errors
    /// `InvalidData` if the name is empty, contains an empty segment, or does
    /// not descend from the root.
    pub fn parse(s: &str) -> Result<Self, QuotaError> {
        if s.is_empty() {
            return Err(QuotaError::InvalidData {
                reason: "entity name must not be empty".to_string(),
            });
        }
        let segments: Vec<String> = s.split(PATH_SEPARATOR).map(str::to_string).collect();
        if segments.iter().any(|seg| seg.is_empty()) {
            return Err(QuotaError::InvalidData {
                reason: format!("entity name {s:?} contains an empty segment"),
            });
        }
        if segments[0] != ROOT_NAME {
            return Err(QuotaError::InvalidData {
                reason: format!("entity name {s:?} does not descend from {ROOT_NAME:?}"),
            });
        }
        Ok(Self {
            segments,
            joined: s.to_string(),
        })
    }

    /// Derive the name of a direct child.
    ///
    /// # Errors
    /// `InvalidData` if `local` is empty or contains the path separator.
    pub fn child(&self, local: &str) -> Result<Self, QuotaError> {
        if local.is_empty() {
            return Err(QuotaError::InvalidData {
                reason: "local name must not be empty".to_string(),
            });
        }
        if local.contains(PATH_SEPARATOR) {
            return Err(QuotaError::InvalidData {
                reason: format!("local name {local:?} must not contain {PATH_SEPARATOR:?}"),
            });
        }
        let mut segments = self.segments.clone();
        segments.push(local.to_string());
        let joined = format!("{}{}{}", self.joined, PATH_SEPARATOR, local);
        Ok(Self { segments, joined })
    }

    /// Parent name; `None` for the root. Pure path computation.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let segments = self.segments[..self.segments.len() - 1].to_vec();
        let joined = segments.join(&PATH_SEPARATOR.to_string());
        Some(Self { segments, joined })
    }

    /// Depth in the tree; the root is level 0.
    pub fn level(&self) -> usize {
        self.segments.len() - 1
    }

    /// Last path segment.
    pub fn local_name(&self) -> &str {
        self.segments
            .last()
            .map(String::as_str)
            .unwrap_or(ROOT_NAME)
    }

    pub fn is_root(&self) -> bool {
        self.segments.len() == 1
    }

    /// True if `self` is a strict ancestor of `other` (not `other` itself).
    ///
    /// Children are discovered by name prefix; a parent never enumerates them.
    pub fn is_ancestor_of(&self, other: &EntityName) -> bool {
        other.segments.len() > self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// The joined `a/b/c` form.
    pub fn as_str(&self) -> &str {
        &self.joined
    }

    /// SQL `LIKE` pattern matching all strict descendants.
    pub fn descendants_pattern(&self) -> String {
        format!("{}{}%", self.joined, PATH_SEPARATOR)
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.joined)
    }
}

impl FromStr for EntityName {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for EntityName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.joined)
    }
}

impl<'de> Deserialize<'de> for EntityName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EntityName::parse(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_round_trips() {
        let n = EntityName::parse("system/users/alice").unwrap();
        assert_eq!(n.as_str(), "system/users/alice");
        assert_eq!(n.local_name(), "alice");
        assert_eq!(n.level(), 2);
    }

    #[test]
    fn root_has_no_parent() {
        assert_eq!(EntityName::root().parent(), None);
        assert_eq!(EntityName::root().level(), 0);
    }

    #[test]
    fn parent_is_pure_path_computation() {
        let n = EntityName::parse("system/users/alice").unwrap();
        let p = n.parent().unwrap();
        assert_eq!(p.as_str(), "system/users");
        assert_eq!(p.parent().unwrap(), EntityName::root());
    }

    #[test]
    fn rejects_empty_segment() {
        assert!(EntityName::parse("system//alice").is_err());
        assert!(EntityName::parse("").is_err());
    }

    #[test]
    fn rejects_names_outside_root() {
        assert!(EntityName::parse("users/alice").is_err());
    }

    #[test]
    fn child_rejects_separator_and_empty() {
        let root = EntityName::root();
        assert!(root.child("").is_err());
        assert!(root.child("a/b").is_err());
        assert_eq!(root.child("users").unwrap().as_str(), "system/users");
    }

    #[test]
    fn ancestor_is_strict() {
        let users = EntityName::parse("system/users").unwrap();
        let alice = EntityName::parse("system/users/alice").unwrap();
        assert!(users.is_ancestor_of(&alice));
        assert!(!alice.is_ancestor_of(&users));
        assert!(!users.is_ancestor_of(&users));
        // Prefix on segments, not on raw strings.
        let usersx = EntityName::parse("system/usersx").unwrap();
        assert!(!users.is_ancestor_of(&usersx));
    }

    #[test]
    fn ordering_compares_segments_not_joined_bytes() {
        let a = EntityName::parse("system/a").unwrap();
        let b = EntityName::parse("system/b").unwrap();
        assert!(a < b);

        // Segment-wise: "a" < "a-x", even though byte-wise the joined forms
        // would sort the other way ('-' < '/').
        let nested = EntityName::parse("system/a/b").unwrap();
        let dashed = EntityName::parse("system/a-x").unwrap();
        assert!(nested < dashed);
    }

    #[test]
    fn serde_as_string() {
        let n = EntityName::parse("system/users/alice").unwrap();
        let js = serde_json::to_string(&n).unwrap();
        assert_eq!(js, "\"system/users/alice\"");
        let back: EntityName = serde_json::from_str(&js).unwrap();
        assert_eq!(back, n);
        assert!(serde_json::from_str::<EntityName>("\"nope\"").is_err());
    }
}

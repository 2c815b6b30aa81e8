use crate::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_LEN: usize = 256;

/// A `/`-separated path into the configuration store, e.g.
/// `cluster/storage_enclosure/controller/user`.
///
/// Only constructed through validation, including on deserialization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyPath(String);

impl KeyPath {
    pub fn parse(path: &str) -> Result<Self, ValidationError> {
        let reject = |reason: &str| ValidationError::KeyPath {
            path: path.to_owned(),
            reason: reason.to_owned(),
        };
        if path.is_empty() {
            return Err(reject("empty"));
        }
        if path.len() > MAX_LEN {
            return Err(reject("longer than 256 characters"));
        }
        for segment in path.split('/') {
            if segment.is_empty() {
                return Err(reject("empty segment"));
            }
            if !segment
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
            {
                return Err(reject("segments must match [A-Za-z0-9_.-]"));
            }
        }
        Ok(Self(path.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Append one or more segments.
    pub fn join(&self, tail: &str) -> Result<Self, ValidationError> {
        Self::parse(&format!("{}/{tail}", self.0))
    }

    /// Segment-wise prefix test: `a/b` contains `a/b/c` but not `a/bc`.
    pub fn contains(&self, other: &KeyPath) -> bool {
        other.0 == self.0
            || (other.0.starts_with(&self.0) && other.0.as_bytes().get(self.0.len()) == Some(&b'/'))
    }
}

impl TryFrom<String> for KeyPath {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<KeyPath> for String {
    fn from(value: KeyPath) -> Self {
        value.0
    }
}

impl std::str::FromStr for KeyPath {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for KeyPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_paths() {
        assert!(KeyPath::parse("replica_count").is_ok());
        assert!(KeyPath::parse("cluster/srvnode-1/network/mgmt.ip").is_ok());
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in ["", "/leading", "trailing/", "a//b", "with space", "a/b*c"] {
            assert!(KeyPath::parse(bad).is_err(), "'{bad}' must be rejected");
        }
        assert!(KeyPath::parse(&"x".repeat(257)).is_err());
    }

    #[test]
    fn contains_is_segment_wise() {
        let prefix = KeyPath::parse("network/primary").unwrap();
        assert!(prefix.contains(&KeyPath::parse("network/primary").unwrap()));
        assert!(prefix.contains(&KeyPath::parse("network/primary/ip").unwrap()));
        assert!(!prefix.contains(&KeyPath::parse("network/primary_alt").unwrap()));
        assert!(!prefix.contains(&KeyPath::parse("network").unwrap()));
    }

    #[test]
    fn join_appends_segments() {
        let base = KeyPath::parse("cluster/controller").unwrap();
        let joined = base.join("primary_mc/ip").unwrap();
        assert_eq!(joined.as_str(), "cluster/controller/primary_mc/ip");
        assert!(base.join("bad segment").is_err());
    }

    #[test]
    fn deserialization_validates() {
        let ok: Result<KeyPath, _> = serde_json::from_str("\"a/b\"");
        assert!(ok.is_ok());
        let bad: Result<KeyPath, _> = serde_json::from_str("\"a//b\"");
        assert!(bad.is_err());
    }

    #[test]
    fn works_as_json_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(KeyPath::parse("a/b").unwrap(), 1);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"a/b":1}"#);
        let back: std::collections::BTreeMap<KeyPath, i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}

//! Total ordering for project-structure and document versions.
//!
//! Versions arrive either as plain integers (`42`) or as dotted strings
//! (`"42.1"`). Comparison is numeric per component, with missing trailing
//! components treated as zero so `"3"` and `"3.0"` compare equal.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A version identifier as produced by the editing layer.
#[derive(Debug, Clone)]
pub enum Version {
    /// Plain integer version.
    Number(u64),
    /// Dotted version string such as `"12.3"`.
    Dotted(String),
}

impl Version {
    /// Numeric components of this version. Non-numeric components count as zero.
    pub fn components(&self) -> Vec<u64> {
        match self {
            Version::Number(n) => vec![*n],
            Version::Dotted(s) => s
                .split('.')
                .map(|part| part.trim().parse::<u64>().unwrap_or(0))
                .collect(),
        }
    }

    /// `self >= other`.
    pub fn gte(&self, other: &Version) -> bool {
        self.cmp(other) != Ordering::Less
    }

    /// `self > other`.
    pub fn gt(&self, other: &Version) -> bool {
        self.cmp(other) == Ordering::Greater
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Version::Number(value)
    }
}

impl From<&str> for Version {
    fn from(value: &str) -> Self {
        Version::Dotted(value.to_string())
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let a = self.components();
        let b = other.components();
        let len = a.len().max(b.len());
        for idx in 0..len {
            let left = a.get(idx).copied().unwrap_or(0);
            let right = b.get(idx).copied().unwrap_or(0);
            match left.cmp(&right) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Number(n) => write!(f, "{n}"),
            Version::Dotted(s) => f.write_str(s),
        }
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Version::Number(n) => serializer.serialize_u64(*n),
            Version::Dotted(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u64),
            Float(f64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(Version::Number(n)),
            Repr::Float(f) => Ok(Version::Dotted(f.to_string())),
            Repr::Text(s) => Ok(Version::Dotted(s)),
        }
    }
}

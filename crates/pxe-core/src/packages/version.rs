//! Package and host version comparison.
//!
//! Versions are dot-separated lists of unsigned integers ("1", "1.10",
//! "2.0.3.1"). Ordering walks segments left to right; the first differing
//! segment decides, and when one version is a prefix of the other the longer
//! one is newer. Every "is this an upgrade" decision goes through [`Version`].

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Versioning errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// Empty version string.
    #[error("empty version string")]
    Empty,

    /// A segment is not an unsigned integer.
    #[error("invalid version segment '{segment}' in '{version}'")]
    InvalidSegment {
        /// The whole version string.
        version: String,
        /// The offending segment.
        segment: String,
    },
}

/// Result type for versioning operations.
pub type Result<T> = std::result::Result<T, VersionError>;

/// A dotted numeric version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    segments: Vec<u64>,
}

impl Version {
    /// Creates a version from its numeric segments.
    ///
    /// # Errors
    /// Returns `VersionError::Empty` if `segments` is empty.
    pub fn new(segments: Vec<u64>) -> Result<Self> {
        if segments.is_empty() {
            return Err(VersionError::Empty);
        }
        Ok(Self { segments })
    }

    /// Parses a version string such as "1.2.0".
    ///
    /// # Arguments
    /// * `version` - Dotted numeric version string
    ///
    /// # Errors
    /// Returns error if the string is empty or a segment is not numeric
    pub fn parse(version: &str) -> Result<Self> {
        let trimmed = version.trim();
        if trimmed.is_empty() {
            return Err(VersionError::Empty);
        }

        let segments = trimmed
            .split('.')
            .map(|segment| {
                segment.parse::<u64>().map_err(|_| VersionError::InvalidSegment {
                    version: trimmed.to_string(),
                    segment: segment.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { segments })
    }

    /// The numeric segments, most significant first.
    pub fn segments(&self) -> &[u64] {
        &self.segments
    }

    /// Returns true if `self` is strictly newer than `other`.
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self > other
    }

    /// Returns true if a package requiring `required` may run on host version `self`.
    pub fn satisfies(&self, required: &Self) -> bool {
        self >= required
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        for (left, right) in self.segments.iter().zip(&other.segments) {
            match left.cmp(right) {
                Ordering::Equal => {}
                decided => return decided,
            }
        }
        self.segments.len().cmp(&other.segments.len())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for segment in &self.segments {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{}", segment)?;
            first = false;
        }
        Ok(())
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Compares two version strings.
///
/// # Arguments
/// * `a` - First version string
/// * `b` - Second version string
///
/// # Returns
/// Ordering of `a` relative to `b`
///
/// # Errors
/// Returns error if either version string is invalid
pub fn compare(a: &str, b: &str) -> Result<Ordering> {
    Ok(Version::parse(a)?.cmp(&Version::parse(b)?))
}

//! Schema version triple

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ErrorCode, SchemaFlowError};

/// A (major, minor, patch) schema version.
///
/// Field order gives the lexicographic total order used everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SchemaVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SchemaVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a `major.minor.patch` string. Pre-release and build suffixes
    /// are rejected.
    pub fn parse(input: &str) -> Result<Self, SchemaFlowError> {
        let parsed = semver::Version::parse(input.trim()).map_err(|e| {
            SchemaFlowError::config_with_code(
                ErrorCode::CONFIG_INVALID_VERSION,
                format!("invalid schema version '{}': {}", input, e),
            )
        })?;

        if !parsed.pre.is_empty() || !parsed.build.is_empty() {
            return Err(SchemaFlowError::config_with_code(
                ErrorCode::CONFIG_INVALID_VERSION,
                format!(
                    "invalid schema version '{}': pre-release and build metadata are not allowed",
                    input
                ),
            ));
        }

        Ok(parsed.into())
    }

    /// True when moving from `previous` to `self` bumps the major component
    pub fn is_major_bump_over(&self, previous: &SchemaVersion) -> bool {
        self.major > previous.major
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SchemaVersion {
    type Err = SchemaFlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SchemaVersion {
    type Error = SchemaFlowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SchemaVersion> for String {
    fn from(version: SchemaVersion) -> Self {
        version.to_string()
    }
}

impl From<semver::Version> for SchemaVersion {
    fn from(version: semver::Version) -> Self {
        Self::new(version.major, version.minor, version.patch)
    }
}

impl From<SchemaVersion> for semver::Version {
    fn from(version: SchemaVersion) -> Self {
        semver::Version::new(version.major, version.minor, version.patch)
    }
}

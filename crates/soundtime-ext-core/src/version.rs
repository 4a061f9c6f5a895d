//! Extension version ordering.
//!
//! Versions are dotted numeric strings compared component-wise, so `1.10.0`
//! is newer than `1.9.0`. Short forms are padded (`2` and `2.0` both mean
//! `2.0.0`); anything else must be valid semver.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ManifestError;

#[derive(Debug, Clone)]
pub struct ExtensionVersion {
    raw: String,
    parsed: semver::Version,
}

impl ExtensionVersion {
    pub fn parse(raw: &str) -> Result<Self, ManifestError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ManifestError::Validation("version must not be empty".into()));
        }

        let parts: Vec<&str> = trimmed.split('.').collect();
        let short_numeric = parts.len() < 3
            && parts
                .iter()
                .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));

        let parsed = if short_numeric {
            let mut padded = parts;
            padded.resize(3, "0");
            semver::Version::parse(&padded.join("."))?
        } else {
            semver::Version::parse(trimmed)?
        };

        Ok(Self {
            raw: trimmed.to_string(),
            parsed,
        })
    }

    /// The string as written in the manifest.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn semver(&self) -> &semver::Version {
        &self.parsed
    }

    pub fn is_newer_than(&self, other: &ExtensionVersion) -> bool {
        self > other
    }
}

impl PartialEq for ExtensionVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ExtensionVersion {}

impl PartialOrd for ExtensionVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExtensionVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parsed.cmp_precedence(&other.parsed)
    }
}

impl fmt::Display for ExtensionVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for ExtensionVersion {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ExtensionVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for ExtensionVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

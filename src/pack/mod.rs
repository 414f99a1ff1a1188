//! Package service: a content-addressed store of
//! `(repository, name, version) -> bytes + envelope metadata`.
//!
//! Phases read and upsert packages through this interface; the Hub mirrors
//! packages into it during cluster copy. Blobs are stored once per SHA-256
//! digest, envelopes reference them by digest.

mod store;

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};

pub use store::PackageService;

/// Address of one package version inside a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    pub repository: String,
    pub name: String,
    pub version: String,
}

impl Locator {
    pub fn new(repository: &str, name: &str, version: &str) -> Self {
        Self {
            repository: repository.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        }
    }

    /// Parse `repository/name:version`.
    pub fn parse(raw: &str) -> Result<Self> {
        let (repository, rest) = raw
            .split_once('/')
            .ok_or_else(|| EngineError::bad_parameter(format!("locator {raw:?} is missing a repository")))?;
        let (name, version) = rest
            .split_once(':')
            .ok_or_else(|| EngineError::bad_parameter(format!("locator {raw:?} is missing a version")))?;
        if repository.is_empty() || name.is_empty() || version.is_empty() {
            return Err(EngineError::bad_parameter(format!("incomplete locator {raw:?}")));
        }
        Ok(Self::new(repository, name, version))
    }

    /// Newer-version comparison used by the update check. Versions compare
    /// numerically per dot-separated component, falling back to a string
    /// compare on non-numeric components.
    pub fn newer_than(&self, other: &Locator) -> bool {
        if self.repository != other.repository || self.name != other.name {
            return false;
        }
        let parse = |v: &str| -> Vec<(u64, String)> {
            v.split('.')
                .map(|c| (c.parse::<u64>().unwrap_or(0), c.to_string()))
                .collect()
        };
        parse(&self.version) > parse(&other.version)
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.repository, self.name, self.version)
    }
}

/// Conventional locator of a cluster's CA package.
pub fn ca_locator(domain: &str) -> Locator {
    Locator::new(crate::model::SYSTEM_REPOSITORY, &format!("ca-{domain}"), "0.0.1")
}

/// Locator of the license CA pulled from the Hub during cluster copy.
pub fn license_ca_locator() -> Locator {
    Locator::new(crate::model::SYSTEM_REPOSITORY, "license-ca", "0.0.1")
}

/// Metadata stored alongside every package blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub locator: Locator,
    /// Hex SHA-256 of the blob.
    pub digest: String,
    pub size: u64,
    /// Whether the blob is encrypted and needs the license-derived key.
    #[serde(default)]
    pub encrypted: bool,
    pub created: chrono::DateTime<chrono::Utc>,
}

/// Options applied when writing a package.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackageOptions {
    pub encrypted: bool,
    /// Insert-or-replace instead of insert-or-already-exists.
    pub upsert: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_parse_roundtrip() {
        let loc = Locator::parse("gravitational.io/planet:7.0.12").unwrap();
        assert_eq!(loc.repository, "gravitational.io");
        assert_eq!(loc.name, "planet");
        assert_eq!(loc.version, "7.0.12");
        assert_eq!(loc.to_string(), "gravitational.io/planet:7.0.12");
    }

    #[test]
    fn locator_parse_rejects_fragments() {
        assert!(Locator::parse("planet:7.0.0").is_err());
        assert!(Locator::parse("repo/planet").is_err());
        assert!(Locator::parse("repo/:1.0.0").is_err());
    }

    #[test]
    fn version_comparison_is_numeric() {
        let old = Locator::new("r", "app", "1.9.0");
        let new = Locator::new("r", "app", "1.10.0");
        assert!(new.newer_than(&old));
        assert!(!old.newer_than(&new));
    }

    #[test]
    fn different_packages_never_compare_newer() {
        let a = Locator::new("r", "app", "2.0.0");
        let b = Locator::new("r", "other", "1.0.0");
        assert!(!a.newer_than(&b));
    }
}

//! Migration names.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_NAME_LEN: usize = 128;

/// Name under which a migration unit is registered and scheduled.
///
/// Names are immutable once a release ships them: jobs already sitting in the
/// queue refer to units by this string. Valid names start with an ASCII letter
/// and contain only ASCII alphanumerics and `_` (e.g. `ExtractUrl`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MigrationName(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid migration name `{name}`: {reason}")]
pub struct InvalidMigrationName {
    pub name: String,
    pub reason: &'static str,
}

impl MigrationName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidMigrationName> {
        let name = name.into();
        let reject = |reason| InvalidMigrationName {
            name: name.clone(),
            reason,
        };

        let Some(first) = name.chars().next() else {
            return Err(reject("must not be empty"));
        };
        if name.len() > MAX_NAME_LEN {
            return Err(reject("must be at most 128 bytes"));
        }
        if !first.is_ascii_alphabetic() {
            return Err(reject("must start with an ASCII letter"));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(reject("may only contain ASCII letters, digits and `_`"));
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for MigrationName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MigrationName {
    type Err = InvalidMigrationName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for MigrationName {
    type Error = InvalidMigrationName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MigrationName> for String {
    fn from(value: MigrationName) -> Self {
        value.0
    }
}

impl PartialEq<str> for MigrationName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for MigrationName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_class_style_names() {
        for ok in ["ExtractUrl", "NormalizeEmail", "Backfill_v2", "a"] {
            assert!(MigrationName::new(ok).is_ok(), "{ok} should be valid");
        }
    }

    #[test]
    fn rejects_malformed_names() {
        assert_eq!(MigrationName::new("").unwrap_err().reason, "must not be empty");
        assert!(MigrationName::new("1Extract").is_err());
        assert!(MigrationName::new("Extract Url").is_err());
        assert!(MigrationName::new("Gitlab::ExtractUrl").is_err());
        assert!(MigrationName::new("x".repeat(129)).is_err());
    }

    #[test]
    fn deserialization_validates() {
        let name: MigrationName = serde_json::from_str("\"ExtractUrl\"").unwrap();
        assert_eq!(name, "ExtractUrl");
        assert!(serde_json::from_str::<MigrationName>("\"drop table\"").is_err());
    }
}

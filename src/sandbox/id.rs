//! Sandbox identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest accepted sandbox ID.
pub const MAX_ID_LEN: usize = 64;

/// Identifier of a sandbox.
///
/// Used verbatim as a directory name under `boxen/` and as the suffix of the
/// host-side remote name, so it only admits ASCII alphanumerics, `-`, `_`
/// and `.` and rejects anything git would refuse as a ref component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SandboxId(String);

impl SandboxId {
    /// Validates a caller-chosen ID.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let invalid = |reason: &str| Error::InvalidSandboxId {
            id: id.clone(),
            reason: reason.to_string(),
        };

        if id.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if id.len() > MAX_ID_LEN {
            return Err(invalid("is too long"));
        }
        // Both name the current commit in git revision syntax.
        if id == "@" || id.eq_ignore_ascii_case("HEAD") {
            return Err(invalid("is reserved by git"));
        }
        if let Some(c) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(invalid(&format!("contains disallowed character {:?}", c)));
        }
        if id.starts_with('.') || id.starts_with('-') {
            return Err(invalid("must not start with '.' or '-'"));
        }
        if id.contains("..") {
            return Err(invalid("must not contain '..'"));
        }
        if id.ends_with(".lock") || id.ends_with('.') {
            return Err(invalid("must not end with '.lock' or '.'"));
        }

        Ok(Self(id))
    }

    /// Generates a random 8-character ID.
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self(uuid.chars().take(8).collect())
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SandboxId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for SandboxId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SandboxId> for String {
    fn from(id: SandboxId) -> Self {
        id.0
    }
}

impl AsRef<str> for SandboxId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        for id in ["demo", "feature-x", "v1.2_try", "A1"] {
            assert!(SandboxId::new(id).is_ok(), "{} should be valid", id);
        }
    }

    #[test]
    fn rejects_path_and_whitespace() {
        for id in ["", "a/b", "..", "a b", "tab\there", "-flag", ".hidden", "x..y", "ref.lock", "back\\slash", "q?"] {
            let err = SandboxId::new(id).unwrap_err();
            assert!(matches!(err, Error::InvalidSandboxId { .. }), "{:?}", id);
        }
    }

    #[test]
    fn rejects_names_git_reserves() {
        for id in ["HEAD", "head", "@"] {
            let err = SandboxId::new(id).unwrap_err();
            assert!(err.to_string().contains("reserved by git"), "{}: {}", id, err);
        }
        assert!(SandboxId::new("HEADS-up").is_ok());
        assert!(SandboxId::new("ahead").is_ok());
    }

    #[test]
    fn rejects_overlong_ids() {
        assert!(SandboxId::new("a".repeat(MAX_ID_LEN)).is_ok());
        assert!(SandboxId::new("a".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn generated_ids_are_valid_and_distinct() {
        let a = SandboxId::generate();
        let b = SandboxId::generate();
        assert_eq!(a.as_str().len(), 8);
        assert!(SandboxId::new(a.as_str()).is_ok());
        assert_ne!(a, b);
    }

    #[test]
    fn deserialization_validates() {
        let ok: SandboxId = serde_json::from_str("\"demo\"").unwrap();
        assert_eq!(ok.as_str(), "demo");
        assert!(serde_json::from_str::<SandboxId>("\"../etc\"").is_err());
    }
}

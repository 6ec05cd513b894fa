//! Module identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::{ModuleError, ModuleResult};

/// Globally unique module id.
///
/// Parsing and deserialization reject the nil UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ModuleId(Uuid);

impl ModuleId {
    /// Wrap a UUID, rejecting nil.
    #[must_use]
    pub fn new(uuid: Uuid) -> Option<Self> {
        (!uuid.is_nil()).then_some(Self(uuid))
    }

    /// Build an id from a raw integer without validation.
    ///
    /// Intended for fixtures and tests.
    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// A fresh random id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an id.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::InvalidId`] for malformed or nil input.
    pub fn parse(raw: &str) -> ModuleResult<Self> {
        Uuid::parse_str(raw.trim())
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| ModuleError::InvalidId(raw.to_string()))
    }

    /// The underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ModuleId {
    type Err = ModuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<ModuleId> for Uuid {
    fn from(id: ModuleId) -> Self {
        id.0
    }
}

impl<'de> Deserialize<'de> for ModuleId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let uuid = Uuid::deserialize(deserializer)?;
        Self::new(uuid)
            .ok_or_else(|| serde::de::Error::custom("module id must not be the nil uuid"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_nil_and_garbage() {
        assert!(ModuleId::parse("00000000-0000-0000-0000-000000000000").is_err());
        assert!(matches!(
            ModuleId::parse("not-a-uuid"),
            Err(ModuleError::InvalidId(raw)) if raw == "not-a-uuid"
        ));
        let id = ModuleId::parse("6f1c0a44-3c0e-4a43-9d62-91c0f4a3b7e2").unwrap();
        assert_eq!(id.to_string(), "6f1c0a44-3c0e-4a43-9d62-91c0f4a3b7e2");
    }

    #[test]
    fn deserialize_rejects_nil() {
        let nil: Result<ModuleId, _> =
            serde_json::from_str("\"00000000-0000-0000-0000-000000000000\"");
        assert!(nil.is_err());
        let quoted = "\"6f1c0a44-3c0e-4a43-9d62-91c0f4a3b7e2\"";
        let ok: ModuleId = serde_json::from_str(quoted).unwrap();
        assert_eq!(serde_json::to_string(&ok).unwrap(), quoted);
    }
}

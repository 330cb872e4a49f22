//! Object identity primitives.
//!
//! # Responsibility
//! - Define the canonical 128-bit `ObjectId` and its textual encoding.
//! - Define the session-scoped `Handle` used to address arena slots.
//!
//! # Invariants
//! - Two `ObjectId`s built from the same 16 bytes are equal, whether they
//!   came from raw bytes or from text in any letter case.
//! - The canonical text form is lower-case hyphenated.
//! - A `Handle` is meaningful only inside the session that issued it.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

/// Globally unique, immutable object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Generates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Builds an identifier from its raw 16-byte value.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parses the textual encoding (hyphenated or simple, any case).
    pub fn parse(value: &str) -> Result<Self, ObjectIdParseError> {
        Uuid::parse_str(value.trim())
            .map(Self)
            .map_err(|_| ObjectIdParseError(value.to_string()))
    }

    /// Raw 16-byte value.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Canonical text used in serialized records and as sort key.
    pub fn to_canonical_string(&self) -> String {
        self.0.hyphenated().to_string()
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ObjectId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for ObjectId {
    type Err = ObjectIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Textual identifier could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectIdParseError(pub String);

impl Display for ObjectIdParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid object identifier `{}`", self.0)
    }
}

impl Error for ObjectIdParseError {}

/// Session-scoped slot index for one registered identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub(crate) u32);

impl Handle {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Display for Handle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::ObjectId;
    use std::collections::HashSet;

    #[test]
    fn bytes_and_text_construct_equal_ids() {
        let id = ObjectId::new();
        let from_bytes = ObjectId::from_bytes(*id.as_bytes());
        let from_upper = ObjectId::parse(&id.to_string().to_uppercase()).unwrap();

        assert_eq!(id, from_bytes);
        assert_eq!(id, from_upper);

        let mut set = HashSet::new();
        set.insert(from_bytes);
        assert!(set.contains(&from_upper));
    }

    #[test]
    fn canonical_text_is_lower_case_hyphenated() {
        let id = ObjectId::parse("C2B4B9C4-5E6F-4A2B-8C3D-000000000001").unwrap();
        assert_eq!(id.to_canonical_string(), "c2b4b9c4-5e6f-4a2b-8c3d-000000000001");
    }

    #[test]
    fn rejects_garbage_text() {
        assert!(ObjectId::parse("not-a-guid").is_err());
    }
}

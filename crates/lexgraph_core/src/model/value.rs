//! Field value shapes stored on domain objects.
//!
//! # Invariants
//! - A field's absence is its default: no scalar, no alternatives, no
//!   targets.
//! - Collection values hold each target at most once; sequence values may
//!   repeat targets for reference kinds.

use crate::model::id::{Handle, ObjectId};
use crate::model::meta::ScalarType;
use std::collections::BTreeMap;

/// Rich formatted text, carried verbatim and never interpreted here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FormattedText(pub String);

impl FormattedText {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalarValue {
    Boolean(bool),
    Integer(i64),
    Time(i64),
    Guid(ObjectId),
    Unicode(String),
    Text(FormattedText),
}

impl ScalarValue {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Self::Boolean(_) => ScalarType::Boolean,
            Self::Integer(_) => ScalarType::Integer,
            Self::Time(_) => ScalarType::Time,
            Self::Guid(_) => ScalarType::Guid,
            Self::Unicode(_) => ScalarType::Unicode,
            Self::Text(_) => ScalarType::FormattedText,
        }
    }
}

/// Stored value of one field on one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Scalar(ScalarValue),
    /// Writing-system tag to alternative text.
    Multi(BTreeMap<String, String>),
    Atomic(Handle),
    Vector(Vec<Handle>),
}

impl FieldValue {
    /// Direct object targets held by this value.
    pub fn targets(&self) -> Vec<Handle> {
        match self {
            Self::Atomic(handle) => vec![*handle],
            Self::Vector(handles) => handles.clone(),
            Self::Scalar(_) | Self::Multi(_) => Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Multi(map) => map.is_empty(),
            Self::Vector(handles) => handles.is_empty(),
            Self::Scalar(_) | Self::Atomic(_) => false,
        }
    }
}

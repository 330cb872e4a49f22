//! Canonical serialized projection of the object graph.
//!
//! # Responsibility
//! - Model serialized records as a small element tree.
//! - Read and write that tree as XML.
//! - Encode/decode domain objects to `<rt>` records and canonicalize them.
//! - Sort whole-repository output without holding it all in memory.
//!
//! # Invariants
//! - Output is a pure function of graph content, never of in-memory order.
//! - Canonicalizing canonical output is a byte-for-byte no-op.

pub mod canonical;
pub mod custom_fields;
pub mod document;
pub mod record;
pub mod sort;
mod xml;

pub use xml::{parse_element, write_element};

use crate::model::meta::CatalogError;
use sort::SortError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type SerialResult<T> = Result<T, SerialError>;

/// One serialized element: name, attributes in stored order, children and
/// optional text content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: Option<String>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Attribute that must be present for the element to be meaningful.
    pub fn required_attr(&self, name: &'static str) -> SerialResult<&str> {
        self.attr(name).ok_or_else(|| SerialError::MissingAttribute {
            element: self.name.clone(),
            attribute: name,
        })
    }

    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

#[derive(Debug)]
pub enum SerialError {
    /// Reader/writer level XML failure.
    Xml(String),
    Malformed(String),
    MissingAttribute {
        element: String,
        attribute: &'static str,
    },
    UnknownClass(String),
    UnknownField {
        class: String,
        field: String,
    },
    InvalidValue {
        field: String,
        value: String,
    },
    Catalog(CatalogError),
    Sort(SortError),
}

impl Display for SerialError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Xml(message) => write!(f, "xml error: {message}"),
            Self::Malformed(message) => write!(f, "malformed record: {message}"),
            Self::MissingAttribute { element, attribute } => {
                write!(f, "element `{element}` is missing attribute `{attribute}`")
            }
            Self::UnknownClass(name) => write!(f, "unknown class `{name}` in record"),
            Self::UnknownField { class, field } => {
                write!(f, "record of class `{class}` has unknown field `{field}`")
            }
            Self::InvalidValue { field, value } => {
                write!(f, "invalid value `{value}` for field `{field}`")
            }
            Self::Catalog(err) => write!(f, "{err}"),
            Self::Sort(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SerialError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Catalog(err) => Some(err),
            Self::Sort(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CatalogError> for SerialError {
    fn from(value: CatalogError) -> Self {
        Self::Catalog(value)
    }
}

impl From<SortError> for SerialError {
    fn from(value: SortError) -> Self {
        Self::Sort(value)
    }
}

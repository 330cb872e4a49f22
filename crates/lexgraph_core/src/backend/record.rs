//! Persisted surrogate for one object.

use crate::model::id::ObjectId;
use crate::serial::record::record_header;
use crate::serial::{parse_element, Element, SerialResult};

/// Canonical record text plus the header fields stores index on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRecord {
    pub id: ObjectId,
    pub class: String,
    pub owner: Option<ObjectId>,
    pub xml: String,
}

impl BackendRecord {
    /// Builds a record from its XML, reading the header from the text.
    pub fn from_xml(xml: String) -> SerialResult<Self> {
        let element = parse_element(&xml)?;
        let (class, id, owner) = record_header(&element)?;
        Ok(Self {
            id,
            class,
            owner,
            xml,
        })
    }

    pub fn element(&self) -> SerialResult<Element> {
        parse_element(&self.xml)
    }
}

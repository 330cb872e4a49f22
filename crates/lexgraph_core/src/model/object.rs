//! Materialized domain object.
//!
//! # Responsibility
//! - Hold class, identity, handle, owner link and field values of one object.
//!
//! # Invariants
//! - `owner` is `None` for roots; otherwise the owner's owning field named by
//!   `OwnerLink::field` contains this object's handle exactly once.
//! - Sequence ordinals are derived from the owner's vector, never cached.

use crate::model::id::{Handle, ObjectId};
use crate::model::meta::{ClassId, FieldId};
use crate::model::value::FieldValue;
use std::collections::BTreeMap;

/// Back-pointer from an owned object to its owning slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerLink {
    pub owner: Handle,
    pub field: FieldId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainObject {
    pub(crate) class: ClassId,
    pub(crate) id: ObjectId,
    pub(crate) handle: Handle,
    pub(crate) owner: Option<OwnerLink>,
    pub(crate) fields: BTreeMap<FieldId, FieldValue>,
}

impl DomainObject {
    pub(crate) fn new(class: ClassId, id: ObjectId, handle: Handle) -> Self {
        Self {
            class,
            id,
            handle,
            owner: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn class(&self) -> ClassId {
        self.class
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn owner(&self) -> Option<OwnerLink> {
        self.owner
    }

    pub fn field(&self, field: FieldId) -> Option<&FieldValue> {
        self.fields.get(&field)
    }

    /// Iterates stored (non-default) fields in field-id order.
    pub fn fields(&self) -> impl Iterator<Item = (FieldId, &FieldValue)> {
        self.fields.iter().map(|(id, value)| (*id, value))
    }
}
